//! Property-based tests for event processing.
//!
//! - Any delivery order of a valid log converges to the same final state
//! - Re-delivery never changes the outcome of a converged log
//! - SAIDs are deterministic over the event body

use std::sync::Arc;

use proptest::prelude::*;

use crate::config::KeveryConfig;
use crate::crypto::{KeyProvider, SoftwareKeyProvider};
use crate::kevery::Kevery;
use crate::store::MemoryKelStore;
use crate::types::{Event, KeyState, Seal, SignedEvent, WitnessConfig};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

/// Builds a valid log of `len` events mixing rotations and interactions.
async fn valid_log(len: usize) -> (Vec<SignedEvent>, KeyState) {
    let mut provider = SoftwareKeyProvider::new();
    let (keys, next) = provider.incept_keys(1, 1).await.unwrap();
    let icp = Event::inception(keys, 1, next, WitnessConfig::default(), vec![]).unwrap();
    let mut state = KeyState::project(None, &icp).unwrap();
    let mut log = vec![sign(&provider, icp).await];

    for i in 1..len {
        let event = if i % 3 == 0 {
            let (keys, next) = provider.prepare_rotation(1).await.unwrap();
            let rot =
                Event::rotation(&state, keys, 1, next, WitnessConfig::default(), vec![]).unwrap();
            let signed = sign(&provider, rot.clone()).await;
            provider.commit_rotation().await.unwrap();
            log.push(signed);
            rot
        } else {
            let seal = Seal::data(&serde_json::json!({ "step": i })).unwrap();
            let ixn = Event::interaction(&state, vec![seal]).unwrap();
            log.push(sign(&provider, ixn.clone()).await);
            ixn
        };
        state = KeyState::project(Some(&state), &event).unwrap();
    }
    (log, state)
}

async fn sign(provider: &SoftwareKeyProvider, event: Event) -> SignedEvent {
    let signatures = provider.sign(event.said.as_bytes()).await.unwrap();
    SignedEvent::new(event, signatures)
}

fn delivery(len: usize) -> impl Strategy<Value = Vec<usize>> {
    (
        Just((0..len).collect::<Vec<_>>()).prop_shuffle(),
        proptest::collection::vec(0..len, 0..len),
    )
        .prop_map(|(mut order, repeats)| {
            order.extend(repeats);
            order
        })
}

// ==================== Convergence Property Tests ====================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Shuffled and duplicated delivery applies the whole log and empties escrow.
    #[test]
    fn shuffled_delivery_converges(order in delivery(7)) {
        runtime().block_on(async {
            let (log, expected) = valid_log(7).await;
            let kevery = Kevery::new(Arc::new(MemoryKelStore::new()), KeveryConfig::default());

            for index in order {
                let outcome = kevery.process(log[index].clone()).await.unwrap();
                prop_assert!(outcome.rejection().is_none(), "unexpected {:?}", outcome);
            }

            let state = kevery.key_state(&expected.pre).await.unwrap();
            prop_assert_eq!(state, Some(expected));
            prop_assert!(kevery.escrow().is_empty());
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// The SAID depends only on the event body.
    #[test]
    fn said_is_deterministic(step in 0u64..1000) {
        let seal = Seal::data(&serde_json::json!({ "step": step })).unwrap();
        let build = |seal: Seal| {
            Event::inception(vec!["k".to_string()], 1, None, WitnessConfig::default(), vec![seal])
                .unwrap()
        };
        let a = build(seal.clone());
        let b = build(seal);
        prop_assert_eq!(&a.said, &b.said);
        prop_assert!(a.verify_said());
    }
}
