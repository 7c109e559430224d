//! Controller workflow tests
//!
//! Habitats share one `Kevery`; witnesses run in-process and feed their
//! receipts straight back into it.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::{LocalWitnesses, kevery, prefixes, witnesses};
use keri::{
    DelegateOptions, DelegationRequest, Habitat, Ilk, InceptOptions, KeriError, RejectReason,
    RotateOptions, Seal, SoftwareKeyProvider,
};

fn habitat(
    kevery: &Arc<keri::Kevery>,
    transport: &Arc<LocalWitnesses>,
) -> Habitat<SoftwareKeyProvider> {
    Habitat::new(
        SoftwareKeyProvider::new(),
        Arc::clone(kevery),
        Arc::clone(transport) as Arc<dyn keri::WitnessTransport>,
    )
}

// ==================== Inception ====================

#[tokio::test]
async fn test_incept_waits_for_witness_quorum() {
    let kevery = kevery();
    let signers = witnesses(3);
    let (transport, _inbox) = LocalWitnesses::new(Arc::clone(&kevery), &signers);
    let mut hab = habitat(&kevery, &transport);

    let state = hab
        .incept(InceptOptions {
            witnesses: prefixes(&signers),
            ..InceptOptions::default()
        })
        .await
        .unwrap();

    assert_eq!(hab.prefix(), Some(state.pre.as_str()));
    assert_eq!(state.toad, 2);
    let receipts = kevery.receipts(&state.pre, &state.said).await.unwrap();
    assert_eq!(receipts.len(), 3);
}

#[tokio::test]
async fn test_incept_twice_is_a_configuration_error() {
    let kevery = kevery();
    let (transport, _inbox) = LocalWitnesses::new(Arc::clone(&kevery), &[]);
    let mut hab = habitat(&kevery, &transport);
    hab.incept(InceptOptions::default()).await.unwrap();

    let result = hab.incept(InceptOptions::default()).await;
    assert!(matches!(result, Err(KeriError::ConfigurationError(_))));
}

#[tokio::test(start_paused = true)]
async fn test_incept_times_out_but_stays_applied() {
    let kevery = kevery();
    let signers = witnesses(3);
    let (transport, _inbox) = LocalWitnesses::new(Arc::clone(&kevery), &signers);
    transport.take_offline(&signers[2].prefix());
    let mut hab = habitat(&kevery, &transport).with_timeout(Duration::from_secs(5));

    let result = hab
        .incept(InceptOptions {
            witnesses: prefixes(&signers),
            toad: Some(3),
            ..InceptOptions::default()
        })
        .await;
    assert!(matches!(result, Err(KeriError::Timeout(_))));

    let pre = hab.prefix().unwrap().to_string();
    let state = kevery.key_state(&pre).await.unwrap().unwrap();
    assert_eq!(state.sn, 0);
    assert_eq!(kevery.receipts(&pre, &state.said).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_publish_fails_when_every_witness_fails() {
    let kevery = kevery();
    let signers = witnesses(2);
    let (transport, _inbox) = LocalWitnesses::new(Arc::clone(&kevery), &signers);
    for signer in &signers {
        transport.take_offline(&signer.prefix());
    }
    let mut hab = habitat(&kevery, &transport);

    let result = hab
        .incept(InceptOptions {
            witnesses: prefixes(&signers),
            ..InceptOptions::default()
        })
        .await;
    assert!(matches!(result, Err(KeriError::SubmissionFailed(_))));
}

// ==================== Rotation ====================

#[tokio::test]
async fn test_rotate_before_incept_is_a_configuration_error() {
    let kevery = kevery();
    let (transport, _inbox) = LocalWitnesses::new(Arc::clone(&kevery), &[]);
    let mut hab = habitat(&kevery, &transport);

    let err = hab.rotate(RotateOptions::default()).await.unwrap_err();
    match err {
        KeriError::ConfigurationError(message) => {
            assert!(message.contains("incept must be run first"));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(hab.state().await.is_err());
}

#[tokio::test]
async fn test_rotate_rejects_witness_list_with_adds() {
    let kevery = kevery();
    let signers = witnesses(2);
    let (transport, _inbox) = LocalWitnesses::new(Arc::clone(&kevery), &signers);
    let mut hab = habitat(&kevery, &transport);
    hab.incept(InceptOptions::default()).await.unwrap();

    let result = hab
        .rotate(RotateOptions {
            witnesses: Some(prefixes(&signers[..1])),
            adds: prefixes(&signers[1..]),
            ..RotateOptions::default()
        })
        .await;
    assert!(matches!(result, Err(KeriError::ConfigurationError(_))));
}

#[tokio::test]
async fn test_rotate_replaces_witness_set() {
    let kevery = kevery();
    let signers = witnesses(4);
    let (transport, _inbox) = LocalWitnesses::new(Arc::clone(&kevery), &signers);
    let mut hab = habitat(&kevery, &transport);
    let incepted = hab
        .incept(InceptOptions {
            witnesses: prefixes(&signers[..3]),
            ..InceptOptions::default()
        })
        .await
        .unwrap();

    let wanted = vec![signers[0].prefix(), signers[1].prefix(), signers[3].prefix()];
    let report = hab
        .rotate(RotateOptions {
            witnesses: Some(wanted.clone()),
            ..RotateOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(report.pre, incepted.pre);
    assert_eq!(report.sn, 1);

    let state = hab.state().await.unwrap();
    assert_eq!(state.ilk, Ilk::Rot);
    assert_eq!(state.keys, report.keys);
    assert_ne!(state.keys, incepted.keys);
    assert_eq!(
        state.witnesses.iter().collect::<BTreeSet<_>>(),
        wanted.iter().collect::<BTreeSet<_>>()
    );
    assert_eq!(state.toad, 2);

    let receipted = kevery.receipts(&state.pre, &state.said).await.unwrap();
    assert!(receipted.contains(&signers[3].prefix()));
    assert!(!receipted.contains(&signers[2].prefix()));
}

#[tokio::test]
async fn test_rejected_rotation_rolls_back_keys() {
    let kevery = kevery();
    let (transport, _inbox) = LocalWitnesses::new(Arc::clone(&kevery), &[]);
    let mut hab = habitat(&kevery, &transport);
    let incepted = hab.incept(InceptOptions::default()).await.unwrap();

    // toad 1 without witnesses
    let result = hab
        .rotate(RotateOptions {
            toad: Some(1),
            ..RotateOptions::default()
        })
        .await;
    assert!(matches!(
        result,
        Err(KeriError::Rejected(RejectReason::InvalidToad))
    ));
    assert_eq!(hab.state().await.unwrap().said, incepted.said);

    // The committed next keys are still usable
    let report = hab.rotate(RotateOptions::default()).await.unwrap();
    assert_eq!(report.sn, 1);
    let report = hab.rotate(RotateOptions::default()).await.unwrap();
    assert_eq!(report.sn, 2);
}

#[tokio::test]
async fn test_interact_anchors_seals() {
    let kevery = kevery();
    let (transport, _inbox) = LocalWitnesses::new(Arc::clone(&kevery), &[]);
    let mut hab = habitat(&kevery, &transport);
    hab.incept(InceptOptions::default()).await.unwrap();

    let seal = Seal::data(&serde_json::json!({ "credential": "abc" })).unwrap();
    let state = hab.interact(vec![seal.clone()]).await.unwrap();
    assert_eq!(state.sn, 1);

    let kel = kevery.kel(&state.pre).await.unwrap().unwrap();
    assert_eq!(kel.event_at(1).unwrap().event.seals, vec![seal]);
}

// ==================== Delegation ====================

#[tokio::test]
async fn test_delegated_inception_and_rotation() {
    let kevery = kevery();
    let signers = witnesses(2);
    let (transport, mut inbox) = LocalWitnesses::new(Arc::clone(&kevery), &signers);

    let mut delegator = habitat(&kevery, &transport);
    let delegator_state = delegator.incept(InceptOptions::default()).await.unwrap();

    let mut delegate = habitat(&kevery, &transport);
    let options = DelegateOptions {
        witnesses: prefixes(&signers),
        ncount: 2,
        nsith: Some(2),
        ..DelegateOptions::new(&delegator_state.pre)
    };
    let task = tokio::spawn(async move {
        let report = delegate.incept_delegated(options).await;
        (delegate, report)
    });

    let fwd = inbox.recv().await.unwrap();
    assert_eq!(fwd.topic, "delegate");
    assert_eq!(fwd.recipient, delegator_state.pre);
    let request = DelegationRequest {
        pre: fwd.message.pre().to_string(),
        sn: fwd.message.sn(),
        said: fwd.message.said().to_string(),
        delegator: delegator_state.pre.clone(),
    };
    delegator.approve_delegation(&request).await.unwrap();

    let (mut delegate, report) = task.await.unwrap();
    let report = report.unwrap();
    assert_eq!(report.pre, request.pre);
    assert_eq!(report.delegator, delegator_state.pre);
    assert_eq!(report.sn, 0);

    let state = delegate.state().await.unwrap();
    assert_eq!(state.ilk, Ilk::Dip);
    assert_eq!(state.signing_threshold, 1);
    assert_eq!(state.delegator.as_deref(), Some(delegator_state.pre.as_str()));
    assert_eq!(kevery.receipts(&state.pre, &state.said).await.unwrap().len(), 2);

    // Delegated rotation also waits for the delegator's seal
    let task = tokio::spawn(async move {
        let report = delegate.rotate(RotateOptions::default()).await;
        (delegate, report)
    });
    let fwd = inbox.recv().await.unwrap();
    assert_eq!(fwd.message.event.ilk, Ilk::Drt);
    delegator
        .approve_delegation(&DelegationRequest {
            pre: fwd.message.pre().to_string(),
            sn: fwd.message.sn(),
            said: fwd.message.said().to_string(),
            delegator: delegator_state.pre.clone(),
        })
        .await
        .unwrap();

    let (mut delegate, report) = task.await.unwrap();
    let report = report.unwrap();
    assert_eq!(report.sn, 1);
    assert_eq!(report.keys.len(), 2);

    // The next threshold given at inception governs the revealed keys
    let state = delegate.state().await.unwrap();
    assert_eq!(state.ilk, Ilk::Drt);
    assert_eq!(state.signing_threshold, 2);
    assert_eq!(delegate.interact(vec![]).await.unwrap().sn, 2);
}

#[tokio::test]
async fn test_approval_for_another_delegator_is_refused() {
    let kevery = kevery();
    let (transport, _inbox) = LocalWitnesses::new(Arc::clone(&kevery), &[]);
    let mut hab = habitat(&kevery, &transport);
    hab.incept(InceptOptions::default()).await.unwrap();

    let request = DelegationRequest {
        pre: "Edelegate".to_string(),
        sn: 0,
        said: "Edelegate".to_string(),
        delegator: "Esomeone-else".to_string(),
    };
    let result = hab.approve_delegation(&request).await;
    assert!(matches!(result, Err(KeriError::ConfigurationError(_))));
}

#[tokio::test(start_paused = true)]
async fn test_unapproved_delegation_times_out() {
    let kevery = kevery();
    let (transport, _inbox) = LocalWitnesses::new(Arc::clone(&kevery), &[]);
    let mut delegator = habitat(&kevery, &transport);
    let delegator_state = delegator.incept(InceptOptions::default()).await.unwrap();

    let mut delegate = habitat(&kevery, &transport).with_timeout(Duration::from_secs(5));
    let result = delegate
        .incept_delegated(DelegateOptions::new(&delegator_state.pre))
        .await;
    assert!(matches!(result, Err(KeriError::Timeout(_))));

    let pre = delegate.prefix().unwrap();
    assert!(kevery.key_state(pre).await.unwrap().is_none());
    assert_eq!(kevery.escrow().len(), 1);
}
