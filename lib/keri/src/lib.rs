//! KERI key event verification library
//!
//! Validates and applies key events and witness receipts, escrows what cannot
//! be verified yet, collects witness quorums, and drives delegated approval.

#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::expect_used, clippy::unwrap_in_result)
)]

pub mod config;
pub mod crypto;
pub mod delegation;
pub mod error;
pub mod escrow;
pub mod file_store;
pub mod kel;
pub mod kevery;
pub mod quorum;
pub mod store;
pub mod types;
pub mod validator;
pub mod workflows;

#[cfg(test)]
mod proptests;

pub use config::KeveryConfig;
pub use crypto::{BasicSigner, KeyProvider, SoftwareKeyProvider};
pub use delegation::{DelegationHandle, DelegationPhase, DelegationTracker, DelegationWatcher};
pub use error::KeriError;
pub use escrow::{EscrowEntry, EscrowStore, Escrowed};
pub use file_store::FileKelStore;
pub use kel::{Kel, LogEntry};
pub use kevery::Kevery;
pub use quorum::{CollectorPhase, Quorum, QuorumHandle, QuorumStatus, WitnessQuorumCollector};
pub use store::{KelStore, MemoryKelStore};
pub use types::{
    DelegationRequest, DuplicityNotice, EscrowReason, Event, Forward, Ilk, IndexedSignature,
    KeyState, Message, Notice, Outcome, Receipt, ReceiptNotice, RejectReason, Seal, SignedEvent,
    StuckNotice, WitnessConfig, WitnessingRequest,
};
pub use validator::{AnchorLookup, ReceiptVerdict, SealIndex, Verdict};
pub use workflows::{
    DelegateOptions, DelegationReport, Habitat, InceptOptions, RotateOptions, RotationReport,
    WitnessTransport,
};
