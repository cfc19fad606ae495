//! Database client capability.
//!
//! [`DbClient`] is the async surface the storage layer talks to; writes that
//! must be atomic go through [`DbClient::transaction_boxed`], whose body gets
//! a synchronous [`DbTransaction`]. Implementations include SQLite (primary)
//! and in-memory (for tests).

use std::any::Any;

use async_trait::async_trait;
use covalue_core::{CoId, CoValueHeader, SessionId, Signature, Transaction};

use crate::error::{Result, StoreError};

/// A stored CoValue row.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCoValueRow {
    pub row_id: i64,
    pub id: CoId,
    /// `None` until a header has been received.
    pub header: Option<CoValueHeader>,
}

/// A stored session row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSessionRow {
    pub row_id: i64,
    pub co_value: i64,
    pub session_id: SessionId,
    /// Number of stored transactions.
    pub last_idx: u32,
    pub last_signature: Signature,
    pub bytes_since_last_signature: usize,
}

/// Values written by [`DbTransaction::add_session_update`].
#[derive(Debug, Clone)]
pub struct SessionUpdate {
    pub co_value: i64,
    pub session_id: SessionId,
    pub last_idx: u32,
    pub last_signature: Signature,
    pub bytes_since_last_signature: usize,
}

/// A signature checkpoint: the signature over the hash after `idx`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureAfterRow {
    pub idx: u32,
    pub signature: Signature,
}

/// Sync state of one CoValue towards one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateUpdate {
    pub id: CoId,
    pub peer_id: String,
    pub synced: bool,
}

/// Writes available inside an atomic database transaction.
pub trait DbTransaction {
    fn get_single_co_value_session(
        &mut self,
        co_value: i64,
        session_id: &SessionId,
    ) -> Result<Option<StoredSessionRow>>;

    /// Upsert a session row, returning its row id.
    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<i64>;

    fn add_transaction(&mut self, session_row: i64, idx: u32, tx: &Transaction) -> Result<()>;

    fn add_signature_after(
        &mut self,
        session_row: i64,
        idx: u32,
        signature: &Signature,
    ) -> Result<()>;

    /// Drop a session with its transactions and checkpoints.
    fn delete_session(&mut self, session_row: i64) -> Result<()>;

    /// Queue `id` for erasure.
    fn mark_co_value_as_deleted(&mut self, id: &CoId) -> Result<()>;
}

/// Body of an atomic transaction. The result is type-erased so the trait stays object safe.
pub type TransactionBody =
    Box<dyn FnOnce(&mut dyn DbTransaction) -> Result<Box<dyn Any + Send>> + Send>;

/// Async interface to the persisted schema.
#[async_trait]
pub trait DbClient: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // CoValue Operations
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_co_value(&self, id: &CoId) -> Result<Option<StoredCoValueRow>>;

    /// Insert the CoValue, or fill in its header. Returns the row id.
    async fn upsert_co_value(&self, id: &CoId, header: Option<&CoValueHeader>) -> Result<i64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Session Operations
    // ─────────────────────────────────────────────────────────────────────────

    async fn get_co_value_sessions(&self, co_value: i64) -> Result<Vec<StoredSessionRow>>;

    /// Checkpoints of a session with `idx >= first_idx`, ordered by idx.
    async fn get_signatures(&self, session_row: i64, first_idx: u32)
        -> Result<Vec<SignatureAfterRow>>;

    /// Transactions with `from_idx <= idx <= to_idx`, ordered by idx.
    async fn get_new_transaction_in_session(
        &self,
        session_row: i64,
        from_idx: u32,
        to_idx: u32,
    ) -> Result<Vec<Transaction>>;

    /// Run `body` atomically. Either every write lands or none does.
    async fn transaction_boxed(&self, body: TransactionBody) -> Result<Box<dyn Any + Send>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Deletion
    // ─────────────────────────────────────────────────────────────────────────

    /// CoValues queued for erasure and not yet erased.
    async fn get_all_co_values_waiting_for_delete(&self) -> Result<Vec<CoId>>;

    /// Erase all non-delete sessions of `id` and mark its queue row done.
    async fn erase_co_value_but_keep_tombstone(&self, id: &CoId) -> Result<()>;

    /// Whether erasure passes should stop at the configured wall-clock budget.
    fn bounded_erasure(&self) -> bool {
        true
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Sync Tracking
    // ─────────────────────────────────────────────────────────────────────────

    async fn track_co_values_sync_state(&self, updates: &[SyncStateUpdate]) -> Result<()>;

    async fn get_unsynced_co_value_ids(&self) -> Result<Vec<CoId>>;

    async fn stop_tracking_sync_state(&self, id: &CoId) -> Result<()>;
}

/// Typed convenience over [`DbClient::transaction_boxed`].
pub trait DbClientExt: DbClient {
    fn transaction<T, F>(&self, body: F) -> impl std::future::Future<Output = Result<T>> + Send
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DbTransaction) -> Result<T> + Send + 'static;
}

impl<C: DbClient + ?Sized> DbClientExt for C {
    async fn transaction<T, F>(&self, body: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn DbTransaction) -> Result<T> + Send + 'static,
    {
        let erased: TransactionBody =
            Box::new(move |tx| body(tx).map(|out| Box::new(out) as Box<dyn Any + Send>));
        let out = self.transaction_boxed(erased).await?;
        out.downcast::<T>()
            .map(|out| *out)
            .map_err(|_| StoreError::InvalidData("transaction result type mismatch".into()))
    }
}
