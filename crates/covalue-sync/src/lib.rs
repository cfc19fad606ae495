//! # CoValue Sync
//!
//! Known-state reconciliation between a node, its storage and its peers.
//!
//! ## Overview
//!
//! Peers exchange four messages per CoValue: `load` (here is what I have,
//! send me the rest), `known` (what I have now), `content` (new
//! transactions, in checkpointed pieces) and `done`. A `known` flagged as a
//! correction tells the sender its assumption about our state was wrong and
//! it should resend from the stated point.
//!
//! ## Key Types
//!
//! - [`SyncManager`]: the per-node coordinator; owns the [`CoValueRegistry`]
//!   and every [`PeerState`]
//! - [`OutgoingLoadQueue`]: caps in-flight loads per peer, with timeouts
//! - [`BatchedOutgoingMessages`]: priority egress that batches frames and
//!   waits on congested or closed channels
//! - [`OutgoingChannel`]: the transport capability; [`channel::memory`]
//!   provides an in-process implementation
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use covalue_core::{DefaultCrypto, TransactionConfig};
//! use covalue_sync::channel::memory::memory_channel;
//! use covalue_sync::{PeerId, PeerRole, SyncConfig, SyncManager};
//!
//! async fn example() -> covalue_sync::Result<()> {
//!     let sync = SyncManager::new(
//!         Arc::new(DefaultCrypto),
//!         TransactionConfig::default(),
//!         None,
//!         SyncConfig::default(),
//!     );
//!     let (channel, _frames) = memory_channel(true);
//!     sync.add_peer(PeerId::new("server"), PeerRole::Server, channel)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Message Flow
//!
//! ```text
//! Client                               Server
//!   |-------- load {sessions} -------->|
//!   |<------- content (piece 1) -------|
//!   |<------- content (piece 2) -------|
//!   |-------- known {sessions} ------->|
//!   |-------- content (local write) -->|
//!   |<------- known {sessions} --------|
//! ```

pub mod batching;
pub mod channel;
pub mod error;
pub mod load_queue;
pub mod manager;
pub mod messages;
pub mod peer;
pub mod registry;

pub use batching::{BatchedOutgoingMessages, OutgoingConfig};
pub use channel::OutgoingChannel;
pub use error::{Result, SyncError};
pub use load_queue::{LoadMode, LoadQueueConfig, OutgoingLoadQueue};
pub use manager::{LoadOutcome, SyncConfig, SyncManager};
pub use messages::{KnownStateMessage, PeerId, PeerMessage, SyncMessage};
pub use peer::{PeerRole, PeerState};
pub use registry::{CoValueEntry, CoValueRegistry, LoadSource, LoadStatus, SourceLoad};
