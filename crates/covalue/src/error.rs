//! Error types for the node.

use covalue_core::{CoId, CoreError};
use covalue_perms::PermsError;
use covalue_store::StoreError;
use covalue_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Permission error.
    #[error("permission error: {0}")]
    Perms(#[from] PermsError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Neither storage nor any peer has the CoValue.
    #[error("unavailable: {0}")]
    Unavailable(CoId),

    /// The CoValue exists but this agent may not read it.
    #[error("unauthorized: {0}")]
    Unauthorized(CoId),

    /// The CoValue was deleted.
    #[error("deleted: {0}")]
    Deleted(CoId),

    /// The CoValue is not of the expected kind.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
