//! # Covalue Store
//!
//! Durable storage for CoValues. A trait-based database client with SQLite
//! and in-memory implementations, and the storage API a node talks to.
//!
//! ## Overview
//!
//! Storage mirrors the in-memory SessionMaps: one row per CoValue, one per
//! session, one per transaction, plus the signature checkpoints that decide
//! how history is chunked when it is streamed back. Writes are serialized
//! through a [`StoreQueue`]. Deleted CoValues are erased in the background
//! by a cancellable eraser that keeps the header and delete sessions.
//!
//! ## Key Types
//!
//! - [`StorageApi`] - Store, load, erase and sync tracking
//! - [`DbClient`] - The async trait over the persisted schema
//! - [`SqliteClient`] - SQLite-based persistent client
//! - [`MemoryClient`] - In-memory client for tests
//! - [`StorageConfig`] - Checkpoint threshold and eraser timing
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use covalue_core::CoId;
//! use covalue_store::{StorageApi, StorageConfig};
//!
//! async fn example() {
//!     // Open a SQLite database
//!     let storage = StorageApi::open_sqlite("covalue.db", StorageConfig::default()).unwrap();
//!
//!     // Or keep everything in memory for testing
//!     let storage = StorageApi::in_memory(StorageConfig::default());
//!
//!     // Stream a CoValue back, dependencies first
//!     let id = CoId::new_unchecked("co_z...");
//!     let pieces = storage.load_co_value(&id, &|_: &CoId| false).await;
//!
//!     // Store a piece, repairing gaps through the callback
//!     // let done = storage.store(piece, correction);
//!     storage.close().await;
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Append only per session**: content that starts past the stored head
//!   triggers one correction; a second is fatal for that store
//! - **Checkpoints**: a signature is kept wherever stored bytes cross the
//!   recommended transaction size, so reloads yield the same pieces
//! - **Tombstones**: erasure never touches the header or delete sessions

pub mod eraser;
pub mod error;
pub mod memory;
pub mod migration;
pub mod queue;
pub mod sqlite;
pub mod storage;
pub mod traits;

pub use eraser::ErasePass;
pub use error::{Result, StoreError};
pub use memory::MemoryClient;
pub use queue::StoreQueue;
pub use sqlite::SqliteClient;
pub use storage::{
    put_new_txs, CorrectionCallback, InMemory, StorageApi, StorageConfig,
};
pub use traits::{
    DbClient, DbClientExt, DbTransaction, SessionUpdate, SignatureAfterRow, StoredCoValueRow,
    StoredSessionRow, SyncStateUpdate, TransactionBody,
};
