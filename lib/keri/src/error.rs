//! KERI Error Types

use thiserror::Error;

use crate::types::RejectReason;

#[derive(Error, Debug)]
pub enum KeriError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Event rejected: {0}")]
    Rejected(#[from] RejectReason),

    #[error("No current key available")]
    NoCurrentKey,

    #[error("No next key available")]
    NoNextKey,

    #[error("No staged rotation")]
    NoStagedRotation,

    #[error("Invalid key event: {0}")]
    InvalidKeyEvent(String),

    #[error("Invalid KEL: {0}")]
    InvalidKel(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    #[error("Witness quorum abandoned for {pre} at sn {sn}")]
    QuorumAbandoned { pre: String, sn: u64 },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
