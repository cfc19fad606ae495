//! In-memory implementation of the DbClient trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence. Transactions run
//! against a staged copy that replaces the live state only on success.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use covalue_core::{CoId, CoValueHeader, SessionId, Signature, Transaction};

use crate::error::{Result, StoreError};
use crate::traits::{
    DbClient, DbTransaction, SessionUpdate, SignatureAfterRow, StoredCoValueRow,
    StoredSessionRow, SyncStateUpdate, TransactionBody,
};

/// In-memory client.
///
/// All data is lost when the client is dropped. Erasure passes run
/// without a time budget.
#[derive(Default)]
pub struct MemoryClient {
    db: Mutex<MemoryDb>,
}

#[derive(Debug, Clone, Default)]
struct MemoryDb {
    next_row: i64,

    /// CoValue id -> (row id, header).
    co_values: BTreeMap<CoId, (i64, Option<CoValueHeader>)>,

    /// Session rows by row id.
    sessions: BTreeMap<i64, StoredSessionRow>,

    /// (session row, idx) -> transaction.
    transactions: BTreeMap<(i64, u32), Transaction>,

    /// (session row, idx) -> checkpoint signature.
    signatures: BTreeMap<(i64, u32), Signature>,

    /// Erasure queue; `true` once erased.
    deleted: BTreeMap<CoId, bool>,

    unsynced: BTreeSet<(CoId, String)>,
}

impl MemoryDb {
    fn next_row_id(&mut self) -> i64 {
        self.next_row += 1;
        self.next_row
    }

    fn session_row(&self, co_value: i64, session_id: &SessionId) -> Option<&StoredSessionRow> {
        self.sessions
            .values()
            .find(|s| s.co_value == co_value && s.session_id == *session_id)
    }

    fn remove_session(&mut self, session_row: i64) {
        self.sessions.remove(&session_row);
        self.transactions.retain(|(ses, _), _| *ses != session_row);
        self.signatures.retain(|(ses, _), _| *ses != session_row);
    }
}

impl MemoryClient {
    /// Create a new empty in-memory client.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryDb>> {
        self.db
            .lock()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

struct MemoryTransaction<'a> {
    db: &'a mut MemoryDb,
}

impl DbTransaction for MemoryTransaction<'_> {
    fn get_single_co_value_session(
        &mut self,
        co_value: i64,
        session_id: &SessionId,
    ) -> Result<Option<StoredSessionRow>> {
        Ok(self.db.session_row(co_value, session_id).cloned())
    }

    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<i64> {
        let row_id = match self.db.session_row(update.co_value, &update.session_id) {
            Some(existing) => existing.row_id,
            None => self.db.next_row_id(),
        };
        self.db.sessions.insert(
            row_id,
            StoredSessionRow {
                row_id,
                co_value: update.co_value,
                session_id: update.session_id.clone(),
                last_idx: update.last_idx,
                last_signature: update.last_signature.clone(),
                bytes_since_last_signature: update.bytes_since_last_signature,
            },
        );
        Ok(row_id)
    }

    fn add_transaction(&mut self, session_row: i64, idx: u32, tx: &Transaction) -> Result<()> {
        if self.db.transactions.contains_key(&(session_row, idx)) {
            return Err(StoreError::InvalidData(format!(
                "transaction {} already stored in session row {}",
                idx, session_row
            )));
        }
        self.db.transactions.insert((session_row, idx), tx.clone());
        Ok(())
    }

    fn add_signature_after(
        &mut self,
        session_row: i64,
        idx: u32,
        signature: &Signature,
    ) -> Result<()> {
        self.db
            .signatures
            .insert((session_row, idx), signature.clone());
        Ok(())
    }

    fn delete_session(&mut self, session_row: i64) -> Result<()> {
        self.db.remove_session(session_row);
        Ok(())
    }

    fn mark_co_value_as_deleted(&mut self, id: &CoId) -> Result<()> {
        self.db.deleted.entry(id.clone()).or_insert(false);
        Ok(())
    }
}

#[async_trait]
impl DbClient for MemoryClient {
    async fn get_co_value(&self, id: &CoId) -> Result<Option<StoredCoValueRow>> {
        let db = self.lock()?;
        Ok(db.co_values.get(id).map(|(row_id, header)| StoredCoValueRow {
            row_id: *row_id,
            id: id.clone(),
            header: header.clone(),
        }))
    }

    async fn upsert_co_value(&self, id: &CoId, header: Option<&CoValueHeader>) -> Result<i64> {
        let mut db = self.lock()?;
        if let Some((row_id, existing)) = db.co_values.get_mut(id) {
            if existing.is_none() {
                *existing = header.cloned();
            }
            return Ok(*row_id);
        }
        let row_id = db.next_row_id();
        db.co_values.insert(id.clone(), (row_id, header.cloned()));
        Ok(row_id)
    }

    async fn get_co_value_sessions(&self, co_value: i64) -> Result<Vec<StoredSessionRow>> {
        let db = self.lock()?;
        let mut sessions: Vec<_> = db
            .sessions
            .values()
            .filter(|s| s.co_value == co_value)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        Ok(sessions)
    }

    async fn get_signatures(
        &self,
        session_row: i64,
        first_idx: u32,
    ) -> Result<Vec<SignatureAfterRow>> {
        let db = self.lock()?;
        Ok(db
            .signatures
            .range((session_row, first_idx)..=(session_row, u32::MAX))
            .map(|(&(_, idx), signature)| SignatureAfterRow {
                idx,
                signature: signature.clone(),
            })
            .collect())
    }

    async fn get_new_transaction_in_session(
        &self,
        session_row: i64,
        from_idx: u32,
        to_idx: u32,
    ) -> Result<Vec<Transaction>> {
        if from_idx > to_idx {
            return Ok(Vec::new());
        }
        let db = self.lock()?;
        Ok(db
            .transactions
            .range((session_row, from_idx)..=(session_row, to_idx))
            .map(|(_, tx)| tx.clone())
            .collect())
    }

    async fn transaction_boxed(&self, body: TransactionBody) -> Result<Box<dyn Any + Send>> {
        let mut db = self.lock()?;
        let mut staged = db.clone();
        let out = body(&mut MemoryTransaction { db: &mut staged })?;
        *db = staged;
        Ok(out)
    }

    async fn get_all_co_values_waiting_for_delete(&self) -> Result<Vec<CoId>> {
        let db = self.lock()?;
        Ok(db
            .deleted
            .iter()
            .filter(|(_, done)| !**done)
            .map(|(id, _)| id.clone())
            .collect())
    }

    async fn erase_co_value_but_keep_tombstone(&self, id: &CoId) -> Result<()> {
        let mut db = self.lock()?;
        if let Some((row_id, _)) = db.co_values.get(id).cloned() {
            let doomed: Vec<i64> = db
                .sessions
                .values()
                .filter(|s| s.co_value == row_id && !s.session_id.is_delete_session())
                .map(|s| s.row_id)
                .collect();
            for session_row in doomed {
                db.remove_session(session_row);
            }
        }
        if let Some(done) = db.deleted.get_mut(id) {
            *done = true;
        }
        Ok(())
    }

    fn bounded_erasure(&self) -> bool {
        false
    }

    async fn track_co_values_sync_state(&self, updates: &[SyncStateUpdate]) -> Result<()> {
        let mut db = self.lock()?;
        for update in updates {
            let key = (update.id.clone(), update.peer_id.clone());
            if update.synced {
                db.unsynced.remove(&key);
            } else {
                db.unsynced.insert(key);
            }
        }
        Ok(())
    }

    async fn get_unsynced_co_value_ids(&self) -> Result<Vec<CoId>> {
        let db = self.lock()?;
        let ids: BTreeSet<CoId> = db.unsynced.iter().map(|(id, _)| id.clone()).collect();
        Ok(ids.into_iter().collect())
    }

    async fn stop_tracking_sync_state(&self, id: &CoId) -> Result<()> {
        let mut db = self.lock()?;
        db.unsynced.retain(|(tracked, _)| tracked != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::DbClientExt;

    #[tokio::test]
    async fn test_duplicate_index_aborts_whole_transaction() {
        let client = MemoryClient::new();
        let id = CoId::new_unchecked("co_zTest");
        let row = client.upsert_co_value(&id, None).await.unwrap();
        let tx = Transaction::Trusting(covalue_core::TrustingTransaction {
            made_at: 1,
            changes: "[]".into(),
            meta: None,
        });

        let result = client
            .transaction(move |db| {
                let ses = db.add_session_update(&SessionUpdate {
                    co_value: row,
                    session_id: SessionId::new_unchecked("s"),
                    last_idx: 1,
                    last_signature: Signature::new_unchecked("signature_z1"),
                    bytes_since_last_signature: 0,
                })?;
                db.add_transaction(ses, 0, &tx)?;
                db.add_transaction(ses, 0, &tx)
            })
            .await;

        assert!(matches!(result, Err(StoreError::InvalidData(_))));
        assert!(client.get_co_value_sessions(row).await.unwrap().is_empty());
    }
}
