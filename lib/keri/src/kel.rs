//! Key Event Log (KEL) - the applied event sequence of one identifier
//!
//! A `Kel` holds the events accepted for a prefix, the key state after each
//! of them, the witness receipts collected per event, and any conflicting
//! events retained as duplicity evidence.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::KeriError;
use crate::types::{KeyState, Receipt, SignedEvent};

/// One persisted record of a log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry", content = "body", rename_all = "camelCase")]
pub enum LogEntry {
    Event(SignedEvent),
    Receipt(Receipt),
    Evidence(SignedEvent),
}

#[derive(Debug, Clone, Default)]
pub struct Kel {
    events: Vec<SignedEvent>,
    states: Vec<KeyState>,
    receipts: HashMap<String, Vec<Receipt>>,
    evidence: Vec<SignedEvent>,
}

impl Kel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from persisted entries.
    ///
    /// Entries were validated before they were written, so only sequencing
    /// and chaining are re-checked here.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, KeriError> {
        let mut kel = Self::new();
        for entry in entries {
            match entry {
                LogEntry::Event(signed) => {
                    let expected_sn = kel.events.len() as u64;
                    if signed.sn() != expected_sn {
                        return Err(KeriError::InvalidKel(format!(
                            "event {} at sn {} where {} was expected",
                            signed.said(),
                            signed.sn(),
                            expected_sn
                        )));
                    }
                    if signed.event.prior.as_deref() != kel.state().map(|s| s.said.as_str()) {
                        return Err(KeriError::InvalidKel(format!(
                            "event {} does not chain from the previous event",
                            signed.said()
                        )));
                    }
                    let state = KeyState::project(kel.state(), &signed.event)?;
                    kel.append(signed, state);
                }
                LogEntry::Receipt(receipt) => {
                    kel.add_receipt(receipt);
                }
                LogEntry::Evidence(signed) => {
                    kel.record_evidence(signed);
                }
            }
        }
        Ok(kel)
    }

    /// Full re-verification of SAIDs, commitments and signatures.
    pub fn verify(&self) -> Result<(), KeriError> {
        let mut prior: Option<&KeyState> = None;
        for (signed, state) in self.events.iter().zip(&self.states) {
            let event = &signed.event;
            if !event.verify_said() {
                return Err(KeriError::InvalidKel(format!("SAID mismatch at sn {}", event.sn)));
            }
            let (keys, threshold) = match prior {
                Some(p) => (&p.keys, p.signing_threshold),
                None => (&event.keys, event.signing_threshold.unwrap_or(1)),
            };
            if event.is_rotation() {
                let committed = prior.and_then(|p| p.next_key_commitment.as_deref());
                if committed != Some(crypto::commit_keys(&event.keys).as_str()) {
                    return Err(KeriError::InvalidKel(format!(
                        "rotation at sn {} breaks the key commitment",
                        event.sn
                    )));
                }
            }
            if !crypto::verify_threshold(keys, threshold, event.said.as_bytes(), &signed.signatures)
            {
                return Err(KeriError::InvalidKel(format!(
                    "insufficient signatures at sn {}",
                    event.sn
                )));
            }
            prior = Some(state);
        }
        Ok(())
    }

    pub fn prefix(&self) -> Option<&str> {
        self.states.first().map(|s| s.pre.as_str())
    }

    pub fn state(&self) -> Option<&KeyState> {
        self.states.last()
    }

    /// Key state as it stood right after the event at `sn`.
    pub fn state_at(&self, sn: u64) -> Option<&KeyState> {
        usize::try_from(sn).ok().and_then(|i| self.states.get(i))
    }

    pub fn event_at(&self, sn: u64) -> Option<&SignedEvent> {
        usize::try_from(sn).ok().and_then(|i| self.events.get(i))
    }

    pub fn events(&self) -> &[SignedEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn receipts_for(&self, said: &str) -> &[Receipt] {
        self.receipts.get(said).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Witness prefixes that have receipted `said`.
    pub fn receipted_by(&self, said: &str) -> Vec<String> {
        self.receipts_for(said)
            .iter()
            .map(|r| r.witness.clone())
            .collect()
    }

    pub fn evidence(&self) -> &[SignedEvent] {
        &self.evidence
    }

    pub fn contains_anchor(&self, said: &str) -> bool {
        self.events.iter().any(|e| e.event.contains_anchor(said))
    }

    pub(crate) fn append(&mut self, signed: SignedEvent, state: KeyState) {
        self.events.push(signed);
        self.states.push(state);
    }

    /// Returns false when the witness already receipted this event.
    pub(crate) fn add_receipt(&mut self, receipt: Receipt) -> bool {
        let receipts = self.receipts.entry(receipt.said.clone()).or_default();
        if receipts.iter().any(|r| r.witness == receipt.witness) {
            return false;
        }
        receipts.push(receipt);
        true
    }

    /// Returns false when the same conflicting event is already on record.
    pub(crate) fn record_evidence(&mut self, signed: SignedEvent) -> bool {
        if self.evidence.iter().any(|e| e.said() == signed.said()) {
            return false;
        }
        self.evidence.push(signed);
        true
    }
}
