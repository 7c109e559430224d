//! Event and receipt validation against the applied log
//!
//! Validation is pure: it reads a [`Kel`] and an [`AnchorLookup`] and returns
//! a verdict. Applying the verdict is the processor's job.

use std::collections::HashMap;

use crate::crypto;
use crate::kel::Kel;
use crate::types::{EscrowReason, Event, Ilk, KeyState, Receipt, RejectReason, SignedEvent};

/// Answers whether a delegator has anchored a delegated event.
pub trait AnchorLookup: Send + Sync {
    fn is_anchored(&self, delegator: &str, pre: &str, sn: u64, said: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Anchor {
    by: String,
    pre: String,
    sn: u64,
}

/// Event seals of every applied event, keyed by anchored SAID.
#[derive(Debug, Default)]
pub struct SealIndex {
    anchors: HashMap<String, Vec<Anchor>>,
}

impl SealIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the event seals carried by an applied event.
    pub fn index(&mut self, event: &Event) {
        for (pre, sn, said) in event.event_seals() {
            let anchor = Anchor {
                by: event.pre.clone(),
                pre: pre.to_string(),
                sn,
            };
            let anchors = self.anchors.entry(said.to_string()).or_default();
            if !anchors.contains(&anchor) {
                anchors.push(anchor);
            }
        }
    }
}

impl AnchorLookup for SealIndex {
    fn is_anchored(&self, delegator: &str, pre: &str, sn: u64, said: &str) -> bool {
        self.anchors
            .get(said)
            .is_some_and(|anchors| {
                anchors
                    .iter()
                    .any(|a| a.by == delegator && a.pre == pre && a.sn == sn)
            })
    }
}

/// What to do with a candidate event.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Valid at the next position; carries the resulting state
    Apply(KeyState),
    /// Identical to the event already applied at that position
    Redelivered,
    Reject(RejectReason),
    Defer(EscrowReason),
}

/// What to do with a witness receipt.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptVerdict {
    Record,
    Duplicate,
    Reject(RejectReason),
    Defer(EscrowReason),
}

fn signed_by(state_keys: &[String], threshold: usize, signed: &SignedEvent) -> bool {
    crypto::verify_threshold(
        state_keys,
        threshold,
        signed.said().as_bytes(),
        &signed.signatures,
    )
}

/// Validates `candidate` against the applied log for its prefix.
///
/// Checks run in a fixed order: structure, position, pre-rotation
/// commitment, signatures, chaining, delegation, witness transition.
pub fn validate(candidate: &SignedEvent, kel: &Kel, anchors: &dyn AnchorLookup) -> Verdict {
    let event = &candidate.event;

    if let Err(reason) = event.validate_structure() {
        return Verdict::Reject(RejectReason::Malformed(reason));
    }
    if !event.verify_said() {
        return Verdict::Reject(RejectReason::Malformed("SAID mismatch".to_string()));
    }

    let Some(state) = kel.state() else {
        if !event.is_inception() {
            return Verdict::Defer(EscrowReason::OutOfOrder);
        }
        if !signed_by(
            &event.keys,
            event.signing_threshold.unwrap_or(1),
            candidate,
        ) {
            return Verdict::Reject(RejectReason::BadSignature);
        }
        if let Some(ref delegator) = event.delegator
            && !anchors.is_anchored(delegator, &event.pre, event.sn, &event.said)
        {
            return Verdict::Defer(EscrowReason::MissingDelegation);
        }
        return match KeyState::project(None, event) {
            Ok(next) => Verdict::Apply(next),
            Err(reason) => Verdict::Reject(reason),
        };
    };

    if event.sn > state.sn + 1 {
        return Verdict::Defer(EscrowReason::OutOfOrder);
    }
    if event.sn <= state.sn {
        return classify_established(candidate, kel);
    }

    match (event.ilk, state.is_delegated()) {
        (Ilk::Rot, true) => {
            return Verdict::Reject(RejectReason::Malformed(
                "delegated identifiers rotate with drt".to_string(),
            ));
        }
        (Ilk::Drt, false) => {
            return Verdict::Reject(RejectReason::Malformed(
                "drt on an identifier without a delegator".to_string(),
            ));
        }
        _ => {}
    }

    if event.is_rotation() {
        let matches = state
            .next_key_commitment
            .as_deref()
            .is_some_and(|committed| committed == crypto::commit_keys(&event.keys));
        if !matches {
            return Verdict::Reject(RejectReason::CommitmentMismatch);
        }
    } else if !state.is_transferable() {
        return Verdict::Reject(RejectReason::Malformed(
            "non-transferable identifier cannot extend its log".to_string(),
        ));
    }

    if !signed_by(&state.keys, state.signing_threshold, candidate) {
        return Verdict::Reject(RejectReason::BadSignature);
    }

    if event.prior.as_deref() != Some(state.said.as_str()) {
        return Verdict::Reject(RejectReason::Duplicity);
    }

    if event.ilk == Ilk::Drt
        && let Some(ref delegator) = state.delegator
        && !anchors.is_anchored(delegator, &event.pre, event.sn, &event.said)
    {
        return Verdict::Defer(EscrowReason::MissingDelegation);
    }

    match KeyState::project(Some(state), event) {
        Ok(next) => Verdict::Apply(next),
        Err(reason) => Verdict::Reject(reason),
    }
}

/// An event at an already applied position is a re-delivery, duplicity, or stale.
fn classify_established(candidate: &SignedEvent, kel: &Kel) -> Verdict {
    let event = &candidate.event;
    if kel
        .event_at(event.sn)
        .is_some_and(|applied| applied.said() == event.said)
    {
        return Verdict::Redelivered;
    }
    if event.sn == 0 {
        return Verdict::Reject(RejectReason::Stale);
    }

    let Some(authority) = kel.state_at(event.sn - 1) else {
        return Verdict::Reject(RejectReason::Stale);
    };
    let chains = event.prior.as_deref() == Some(authority.said.as_str());
    if chains && signed_by(&authority.keys, authority.signing_threshold, candidate) {
        Verdict::Reject(RejectReason::Duplicity)
    } else {
        Verdict::Reject(RejectReason::Stale)
    }
}

/// Validates a witness receipt. `kel` is the receipted identifier's log, if known.
pub fn validate_receipt(receipt: &Receipt, kel: Option<&Kel>) -> ReceiptVerdict {
    if !crypto::verify_signature(&receipt.witness, receipt.said.as_bytes(), &receipt.signature) {
        return ReceiptVerdict::Reject(RejectReason::BadSignature);
    }

    let Some(kel) = kel else {
        return ReceiptVerdict::Defer(EscrowReason::PartialReceipts);
    };
    let (Some(applied), Some(state)) = (kel.event_at(receipt.sn), kel.state_at(receipt.sn)) else {
        return ReceiptVerdict::Defer(EscrowReason::PartialReceipts);
    };
    if applied.said() != receipt.said {
        return ReceiptVerdict::Reject(RejectReason::Stale);
    }
    if !state.witnesses.contains(&receipt.witness) {
        return ReceiptVerdict::Reject(RejectReason::BadSignature);
    }
    if kel
        .receipts_for(&receipt.said)
        .iter()
        .any(|r| r.witness == receipt.witness)
    {
        return ReceiptVerdict::Duplicate;
    }
    ReceiptVerdict::Record
}
