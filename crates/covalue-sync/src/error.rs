//! Error types for the sync module.

use thiserror::Error;

use covalue_core::CoId;

use crate::messages::PeerId;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Message could not be encoded or decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    /// Channel-level error.
    #[error("channel error: {0}")]
    Channel(String),

    /// The channel or queue was closed.
    #[error("channel closed")]
    Closed,

    /// Storage operation failed.
    #[error("store error: {0}")]
    Store(#[from] covalue_store::StoreError),

    /// Core operation failed.
    #[error("core error: {0}")]
    Core(#[from] covalue_core::CoreError),

    /// Timeout waiting for a peer.
    #[error("timeout loading {0}")]
    Timeout(CoId),

    /// Peer is not connected.
    #[error("peer not connected: {0}")]
    PeerNotConnected(PeerId),

    /// Shared state lock was poisoned.
    #[error("sync state poisoned: {0}")]
    Poisoned(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
