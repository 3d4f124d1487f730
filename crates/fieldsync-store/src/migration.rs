//! Database schema migrations for SQLite.
//!
//! Versioned migrations: each one moves the schema from version N to N+1.
//! The same schema backs a structured syncfile and a directory's `log.db`.

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::now_millis;

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema. Idempotent.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {current} is newer than supported version {CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;
            debug!(version, "applied schema migration");

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
    }

    Ok(())
}

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
        -- Log entries, one row per (log, seq)
        CREATE TABLE entries (
            entry_id BLOB PRIMARY KEY,        -- 32 bytes, Blake3 hash of canonical bytes
            log_key BLOB NOT NULL,            -- 32 bytes
            seq INTEGER NOT NULL,             -- 1-indexed position in the log
            version INTEGER NOT NULL,
            author BLOB NOT NULL,             -- 32 bytes, Ed25519 public key
            timestamp INTEGER NOT NULL,       -- author-claimed timestamp (Unix ms)
            prev BLOB,                        -- 32 bytes, NULL for seq = 1
            payload_hash BLOB NOT NULL,
            payload BLOB NOT NULL,
            signature BLOB NOT NULL,          -- 64 bytes
            ingested_at INTEGER NOT NULL,

            UNIQUE(log_key, seq)
        );

        -- Fork evidence
        CREATE TABLE forks (
            log_key BLOB NOT NULL,
            seq INTEGER NOT NULL,
            entry_id BLOB NOT NULL,
            detected_at INTEGER NOT NULL,
            PRIMARY KEY (log_key, seq, entry_id)
        );

        -- Media blobs by name
        CREATE TABLE media (
            name TEXT PRIMARY KEY,
            data BLOB NOT NULL,
            stored_at INTEGER NOT NULL
        );

        -- Container metadata (e.g. the "p2p-db" format stamp)
        CREATE TABLE meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX idx_entries_log_seq ON entries(log_key, seq);
        "#,
    )?;

    Ok(())
}
