//! SQLite implementation of the DbClient trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.

use std::any::Any;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use covalue_core::{CoId, CoValueHeader, SessionId, Signature, Transaction};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    DbClient, DbTransaction, SessionUpdate, SignatureAfterRow, StoredCoValueRow,
    StoredSessionRow, SyncStateUpdate, TransactionBody,
};

/// SQLite-based client.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteClient {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteClient {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection from the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| {
            StoreError::Database(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_MISUSE),
                Some(format!("spawn_blocking failed: {}", e)),
            ))
        })?
    }
}

fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    conn.lock().map_err(|e| {
        StoreError::Database(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
            Some(format!("mutex poisoned: {}", e)),
        ))
    })
}

fn encode_blob<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)?;
    Ok(buf)
}

fn decode_blob<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(ciborium::from_reader(bytes)?)
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSessionRow> {
    let session_id: String = row.get("sessionID")?;
    let last_signature: String = row.get("lastSignature")?;
    let bytes: i64 = row.get("bytesSinceLastSignature")?;
    Ok(StoredSessionRow {
        row_id: row.get("rowID")?,
        co_value: row.get("coValue")?,
        session_id: SessionId::new_unchecked(session_id),
        last_idx: row.get("lastIdx")?,
        last_signature: Signature::new_unchecked(last_signature),
        bytes_since_last_signature: bytes.max(0) as usize,
    })
}

/// A [`DbTransaction`] over an open rusqlite transaction.
struct SqliteTransaction<'a> {
    tx: &'a rusqlite::Transaction<'a>,
}

impl DbTransaction for SqliteTransaction<'_> {
    fn get_single_co_value_session(
        &mut self,
        co_value: i64,
        session_id: &SessionId,
    ) -> Result<Option<StoredSessionRow>> {
        Ok(self
            .tx
            .query_row(
                "SELECT * FROM sessions WHERE coValue = ?1 AND sessionID = ?2",
                params![co_value, session_id.as_str()],
                row_to_session,
            )
            .optional()?)
    }

    fn add_session_update(&mut self, update: &SessionUpdate) -> Result<i64> {
        let row_id = self.tx.query_row(
            "INSERT INTO sessions (coValue, sessionID, lastIdx, lastSignature, bytesSinceLastSignature)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(sessionID, coValue) DO UPDATE SET
                lastIdx = excluded.lastIdx,
                lastSignature = excluded.lastSignature,
                bytesSinceLastSignature = excluded.bytesSinceLastSignature
             RETURNING rowID",
            params![
                update.co_value,
                update.session_id.as_str(),
                update.last_idx,
                update.last_signature.as_str(),
                update.bytes_since_last_signature as i64,
            ],
            |row| row.get(0),
        )?;
        Ok(row_id)
    }

    fn add_transaction(&mut self, session_row: i64, idx: u32, tx: &Transaction) -> Result<()> {
        self.tx.execute(
            "INSERT INTO transactions (ses, idx, tx) VALUES (?1, ?2, ?3)",
            params![session_row, idx, encode_blob(tx)?],
        )?;
        Ok(())
    }

    fn add_signature_after(
        &mut self,
        session_row: i64,
        idx: u32,
        signature: &Signature,
    ) -> Result<()> {
        self.tx.execute(
            "INSERT OR REPLACE INTO signatureAfter (ses, idx, signature) VALUES (?1, ?2, ?3)",
            params![session_row, idx, signature.as_str()],
        )?;
        Ok(())
    }

    fn delete_session(&mut self, session_row: i64) -> Result<()> {
        self.tx
            .execute("DELETE FROM transactions WHERE ses = ?1", params![session_row])?;
        self.tx
            .execute("DELETE FROM signatureAfter WHERE ses = ?1", params![session_row])?;
        self.tx
            .execute("DELETE FROM sessions WHERE rowID = ?1", params![session_row])?;
        Ok(())
    }

    fn mark_co_value_as_deleted(&mut self, id: &CoId) -> Result<()> {
        self.tx.execute(
            "INSERT OR IGNORE INTO deletedCoValues (coValueID, status) VALUES (?1, 0)",
            params![id.as_str()],
        )?;
        Ok(())
    }
}

#[async_trait]
impl DbClient for SqliteClient {
    async fn get_co_value(&self, id: &CoId) -> Result<Option<StoredCoValueRow>> {
        let id = id.clone();
        self.run(move |conn| {
            let row: Option<(i64, Option<Vec<u8>>)> = conn
                .query_row(
                    "SELECT rowID, header FROM coValues WHERE id = ?1",
                    params![id.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((row_id, header)) = row else {
                return Ok(None);
            };
            let header = header.map(|bytes| decode_blob(&bytes)).transpose()?;
            Ok(Some(StoredCoValueRow { row_id, id, header }))
        })
        .await
    }

    async fn upsert_co_value(&self, id: &CoId, header: Option<&CoValueHeader>) -> Result<i64> {
        let id = id.clone();
        let header = header.map(encode_blob).transpose()?;
        self.run(move |conn| {
            let row_id = conn.query_row(
                "INSERT INTO coValues (id, header) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET header = COALESCE(coValues.header, excluded.header)
                 RETURNING rowID",
                params![id.as_str(), header],
                |row| row.get(0),
            )?;
            Ok(row_id)
        })
        .await
    }

    async fn get_co_value_sessions(&self, co_value: i64) -> Result<Vec<StoredSessionRow>> {
        self.run(move |conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM sessions WHERE coValue = ?1 ORDER BY sessionID")?;
            let rows = stmt
                .query_map(params![co_value], row_to_session)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn get_signatures(
        &self,
        session_row: i64,
        first_idx: u32,
    ) -> Result<Vec<SignatureAfterRow>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT idx, signature FROM signatureAfter WHERE ses = ?1 AND idx >= ?2 ORDER BY idx",
            )?;
            let rows = stmt
                .query_map(params![session_row, first_idx], |row| {
                    let signature: String = row.get(1)?;
                    Ok(SignatureAfterRow {
                        idx: row.get(0)?,
                        signature: Signature::new_unchecked(signature),
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    async fn get_new_transaction_in_session(
        &self,
        session_row: i64,
        from_idx: u32,
        to_idx: u32,
    ) -> Result<Vec<Transaction>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT tx FROM transactions WHERE ses = ?1 AND idx >= ?2 AND idx <= ?3 ORDER BY idx",
            )?;
            let blobs = stmt
                .query_map(params![session_row, from_idx, to_idx], |row| {
                    row.get::<_, Vec<u8>>(0)
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            blobs.iter().map(|bytes| decode_blob(bytes)).collect()
        })
        .await
    }

    async fn transaction_boxed(&self, body: TransactionBody) -> Result<Box<dyn Any + Send>> {
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let out = {
                let mut db_tx = SqliteTransaction { tx: &tx };
                body(&mut db_tx)?
            };
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    async fn get_all_co_values_waiting_for_delete(&self) -> Result<Vec<CoId>> {
        self.run(|conn| {
            let mut stmt = conn
                .prepare("SELECT coValueID FROM deletedCoValues WHERE status = 0 ORDER BY coValueID")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(CoId::new_unchecked).collect())
        })
        .await
    }

    async fn erase_co_value_but_keep_tombstone(&self, id: &CoId) -> Result<()> {
        let id = id.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let sessions: Vec<(i64, String)> = {
                let mut stmt = tx.prepare(
                    "SELECT s.rowID, s.sessionID FROM sessions s
                     JOIN coValues c ON c.rowID = s.coValue
                     WHERE c.id = ?1",
                )?;
                let rows = stmt
                    .query_map(params![id.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            };
            {
                let mut db_tx = SqliteTransaction { tx: &tx };
                for (row_id, session_id) in sessions {
                    if !covalue_core::ids::is_delete_session_id(&session_id) {
                        db_tx.delete_session(row_id)?;
                    }
                }
            }
            tx.execute(
                "UPDATE deletedCoValues SET status = 1 WHERE coValueID = ?1",
                params![id.as_str()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn track_co_values_sync_state(&self, updates: &[SyncStateUpdate]) -> Result<()> {
        let updates = updates.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for update in &updates {
                if update.synced {
                    tx.execute(
                        "DELETE FROM unsynced_covalues WHERE co_value_id = ?1 AND peer_id = ?2",
                        params![update.id.as_str(), update.peer_id],
                    )?;
                } else {
                    tx.execute(
                        "INSERT OR IGNORE INTO unsynced_covalues (co_value_id, peer_id) VALUES (?1, ?2)",
                        params![update.id.as_str(), update.peer_id],
                    )?;
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_unsynced_co_value_ids(&self) -> Result<Vec<CoId>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT co_value_id FROM unsynced_covalues ORDER BY co_value_id",
            )?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids.into_iter().map(CoId::new_unchecked).collect())
        })
        .await
    }

    async fn stop_tracking_sync_state(&self, id: &CoId) -> Result<()> {
        let id = id.clone();
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM unsynced_covalues WHERE co_value_id = ?1",
                params![id.as_str()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::DbClientExt;
    use covalue_core::{AgentId, TrustingTransaction};

    fn header() -> CoValueHeader {
        let admin = AgentId::new_unchecked("sealer_z1/signer_z2");
        CoValueHeader::group(admin, "u")
    }

    fn tx(made_at: u64) -> Transaction {
        Transaction::Trusting(TrustingTransaction {
            made_at,
            changes: "[]".into(),
            meta: None,
        })
    }

    fn session(name: &str) -> SessionId {
        SessionId::new_unchecked(name)
    }

    #[tokio::test]
    async fn test_upsert_keeps_first_header() {
        let client = SqliteClient::open_memory().unwrap();
        let id = CoId::new_unchecked("co_zTest");

        let row = client.upsert_co_value(&id, None).await.unwrap();
        assert!(client.get_co_value(&id).await.unwrap().unwrap().header.is_none());

        let again = client.upsert_co_value(&id, Some(&header())).await.unwrap();
        assert_eq!(row, again);
        let stored = client.get_co_value(&id).await.unwrap().unwrap();
        assert_eq!(stored.header, Some(header()));
    }

    #[tokio::test]
    async fn test_transaction_roundtrip() {
        let client = SqliteClient::open_memory().unwrap();
        let id = CoId::new_unchecked("co_zTest");
        let row = client.upsert_co_value(&id, Some(&header())).await.unwrap();

        let ses_row = client
            .transaction(move |db| {
                let ses = db.add_session_update(&SessionUpdate {
                    co_value: row,
                    session_id: session("s1"),
                    last_idx: 2,
                    last_signature: Signature::new_unchecked("signature_z1"),
                    bytes_since_last_signature: 4,
                })?;
                db.add_transaction(ses, 0, &tx(1))?;
                db.add_transaction(ses, 1, &tx(2))?;
                db.add_signature_after(ses, 0, &Signature::new_unchecked("signature_z0"))?;
                Ok(ses)
            })
            .await
            .unwrap();

        let sessions = client.get_co_value_sessions(row).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].last_idx, 2);
        assert_eq!(sessions[0].bytes_since_last_signature, 4);

        let txs = client.get_new_transaction_in_session(ses_row, 0, 1).await.unwrap();
        assert_eq!(txs, vec![tx(1), tx(2)]);
        let sigs = client.get_signatures(ses_row, 0).await.unwrap();
        assert_eq!(sigs.len(), 1);
        assert_eq!(sigs[0].idx, 0);
    }

    #[tokio::test]
    async fn test_failed_transaction_rolls_back() {
        let client = SqliteClient::open_memory().unwrap();
        let id = CoId::new_unchecked("co_zTest");
        let row = client.upsert_co_value(&id, Some(&header())).await.unwrap();

        let result = client
            .transaction(move |db| {
                db.add_session_update(&SessionUpdate {
                    co_value: row,
                    session_id: session("s1"),
                    last_idx: 1,
                    last_signature: Signature::new_unchecked("signature_z1"),
                    bytes_since_last_signature: 0,
                })?;
                Err::<(), _>(StoreError::InvalidData("abort".into()))
            })
            .await;

        assert!(result.is_err());
        assert!(client.get_co_value_sessions(row).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_erase_keeps_delete_session() {
        let client = SqliteClient::open_memory().unwrap();
        let id = CoId::new_unchecked("co_zTest");
        let row = client.upsert_co_value(&id, Some(&header())).await.unwrap();
        let delete_session = session("sealer_z1/signer_z2_session_dX$");

        let marker = id.clone();
        let delete_for_tx = delete_session.clone();
        client
            .transaction(move |db| {
                for sid in [session("sealer_z1/signer_z2_session_zA"), delete_for_tx] {
                    let ses = db.add_session_update(&SessionUpdate {
                        co_value: row,
                        session_id: sid,
                        last_idx: 1,
                        last_signature: Signature::new_unchecked("signature_z1"),
                        bytes_since_last_signature: 0,
                    })?;
                    db.add_transaction(ses, 0, &tx(1))?;
                }
                db.mark_co_value_as_deleted(&marker)
            })
            .await
            .unwrap();

        assert_eq!(
            client.get_all_co_values_waiting_for_delete().await.unwrap(),
            vec![id.clone()]
        );
        client.erase_co_value_but_keep_tombstone(&id).await.unwrap();

        let sessions = client.get_co_value_sessions(row).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, delete_session);
        assert!(client
            .get_all_co_values_waiting_for_delete()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_sync_tracking() {
        let client = SqliteClient::open_memory().unwrap();
        let a = CoId::new_unchecked("co_zA");
        let b = CoId::new_unchecked("co_zB");

        client
            .track_co_values_sync_state(&[
                SyncStateUpdate { id: a.clone(), peer_id: "server".into(), synced: false },
                SyncStateUpdate { id: b.clone(), peer_id: "server".into(), synced: false },
            ])
            .await
            .unwrap();
        client
            .track_co_values_sync_state(&[SyncStateUpdate {
                id: a.clone(),
                peer_id: "server".into(),
                synced: true,
            }])
            .await
            .unwrap();
        assert_eq!(client.get_unsynced_co_value_ids().await.unwrap(), vec![b.clone()]);

        client.stop_tracking_sync_state(&b).await.unwrap();
        assert!(client.get_unsynced_co_value_ids().await.unwrap().is_empty());
    }
}
