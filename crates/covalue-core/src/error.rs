//! Error types for covalue core.

use thiserror::Error;

use crate::ids::{CoId, SessionId};

/// Core errors that can occur while building, verifying or decrypting logs.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A batch signature did not match the recomputed hash chain.
    #[error("signature verification failed for session {session} of {id}")]
    SignatureVerification { id: CoId, session: SessionId },

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid id: {0}")]
    InvalidId(String),

    /// The header hash does not match the id it was received under.
    #[error("header does not match id {0}")]
    HeaderMismatch(CoId),

    /// Writes to a deleted CoValue are only accepted from delete sessions.
    #[error("cannot write to deleted covalue {0}")]
    DeletedCoValue(CoId),

    /// A delete marker that is malformed or not allowed here.
    #[error("invalid delete: {0}")]
    InvalidDelete(String),

    #[error("transaction {idx} not found in session {session}")]
    TransactionNotFound { session: SessionId, idx: usize },

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Encoding(e.to_string())
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
