//! Processing outcomes and outbound notices

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::state::KeyState;

/// Terminal reasons an event or receipt is refused.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    #[error("signatures do not satisfy the authoritative key set")]
    BadSignature,
    #[error("event is at or below the current sequence number")]
    Stale,
    #[error("conflicting event at an already established sequence number")]
    Duplicity,
    #[error("keys do not match the prior next-key commitment")]
    CommitmentMismatch,
    #[error("witness threshold is invalid for the witness set")]
    InvalidToad,
    #[error("malformed event: {0}")]
    Malformed(String),
    #[error("escrow retry or age ceiling exceeded")]
    EscrowExpired,
}

/// Recoverable conditions that park an item in escrow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EscrowReason {
    /// Prior event not yet applied
    OutOfOrder,
    /// Delegator has not anchored the approval seal
    MissingDelegation,
    /// Receipt whose target event is not yet applied
    PartialReceipts,
}

impl fmt::Display for EscrowReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::OutOfOrder => "out-of-order",
            Self::MissingDelegation => "missing-delegation",
            Self::PartialReceipts => "partial-receipts",
        };
        write!(f, "{}", s)
    }
}

/// Result of `Kevery::process`.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Applied, or an identical re-delivery. Carries the identifier's state afterwards.
    Accepted(KeyState),
    Rejected(RejectReason),
    Deferred(EscrowReason),
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted(_))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    pub fn state(&self) -> Option<&KeyState> {
        match self {
            Self::Accepted(state) => Some(state),
            _ => None,
        }
    }

    pub fn rejection(&self) -> Option<&RejectReason> {
        match self {
            Self::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

/// What a quorum collector needs to solicit receipts for an accepted event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WitnessingRequest {
    pub pre: String,
    pub sn: u64,
    pub said: String,
    pub witnesses: Vec<String>,
    pub toad: usize,
}

impl WitnessingRequest {
    pub fn from_state(state: &KeyState) -> Self {
        Self {
            pre: state.pre.clone(),
            sn: state.sn,
            said: state.said.clone(),
            witnesses: state.witnesses.clone(),
            toad: state.toad,
        }
    }
}

/// A delegated event waiting for its delegator's anchoring seal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationRequest {
    pub pre: String,
    pub sn: u64,
    pub said: String,
    pub delegator: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptNotice {
    pub pre: String,
    pub sn: u64,
    pub said: String,
    pub witness: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicityNotice {
    pub pre: String,
    pub sn: u64,
    /// SAID of the event already applied at `sn`
    pub applied: Option<String>,
    pub conflicting: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StuckNotice {
    pub reason: EscrowReason,
    pub pre: String,
    pub sn: u64,
    pub said: String,
    pub retries: u32,
}

/// Broadcast by `Kevery` for workflows, watchers and collectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Accepted(WitnessingRequest),
    DelegationPending(DelegationRequest),
    Receipted(ReceiptNotice),
    Duplicity(DuplicityNotice),
    Stuck(StuckNotice),
}
