//! Database schema migrations for SQLite.
//!
//! Versioned migrations: each version is a SQL batch that moves the schema
//! from N-1 to N, recorded in `schema_migrations`.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per CoValue; header is a CBOR blob, NULL until received
        CREATE TABLE coValues (
            rowID INTEGER PRIMARY KEY,
            id TEXT NOT NULL UNIQUE,
            header BLOB
        );

        -- Per-session progress
        CREATE TABLE sessions (
            rowID INTEGER PRIMARY KEY,
            coValue INTEGER NOT NULL,
            sessionID TEXT NOT NULL,
            lastIdx INTEGER NOT NULL,
            lastSignature TEXT NOT NULL,
            bytesSinceLastSignature INTEGER NOT NULL DEFAULT 0,
            UNIQUE (sessionID, coValue)
        );

        -- Transactions, CBOR encoded, indexed from 0 per session
        CREATE TABLE transactions (
            ses INTEGER NOT NULL,
            idx INTEGER NOT NULL,
            tx BLOB NOT NULL,
            PRIMARY KEY (ses, idx)
        ) WITHOUT ROWID;

        -- Signature checkpoints: signature over the hash after `idx`
        CREATE TABLE signatureAfter (
            ses INTEGER NOT NULL,
            idx INTEGER NOT NULL,
            signature TEXT NOT NULL,
            PRIMARY KEY (ses, idx)
        ) WITHOUT ROWID;

        -- Erasure queue: 0 = pending, 1 = done
        CREATE TABLE deletedCoValues (
            coValueID TEXT PRIMARY KEY,
            status INTEGER NOT NULL DEFAULT 0
        );

        -- Content not yet confirmed by a peer
        CREATE TABLE unsynced_covalues (
            rowID INTEGER PRIMARY KEY,
            co_value_id TEXT NOT NULL,
            peer_id TEXT NOT NULL,
            UNIQUE (co_value_id, peer_id)
        );

        CREATE INDEX sessionsByCoValue ON sessions (coValue);
        CREATE INDEX deletedCoValuesByStatus ON deletedCoValues (status);
        CREATE INDEX unsyncedByCoValue ON unsynced_covalues (co_value_id);
        "#,
    )?;

    Ok(())
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        for table in [
            "coValues",
            "sessions",
            "transactions",
            "signatureAfter",
            "deletedCoValues",
            "unsynced_covalues",
            "schema_migrations",
        ] {
            assert!(tables.contains(&table.to_string()), "missing {}", table);
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row(
                "SELECT MAX(version) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, 1);
    }
}
