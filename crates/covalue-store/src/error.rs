//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Blob encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid data in storage, or a write that would break session continuity.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// The store queue no longer accepts requests.
    #[error("store queue closed")]
    Closed,

    /// A lock guarding client state was poisoned.
    #[error("lock poisoned: {0}")]
    Poisoned(String),

    /// Core error while decoding stored content.
    #[error("core error: {0}")]
    Core(#[from] covalue_core::CoreError),
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(err: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(err: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
