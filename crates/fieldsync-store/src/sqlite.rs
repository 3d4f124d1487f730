//! SQLite store.
//!
//! One SQLite file holds logs, fork evidence, media blobs and a small metadata
//! table. This is the structured syncfile format and the `log.db` of a sync
//! directory. rusqlite calls run on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;
use tracing::debug;

use fieldsync_core::{Blake3Hash, DeviceId, Entry, EntryHeader, EntryId, LogKey, LogLengths, Signature};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::now_millis;
use crate::traits::{
    validate_media_name, Appended, Fork, InsertResult, LogStore, MediaStore,
    APPEND_CHANNEL_CAPACITY,
};

/// SQLite-backed log and media store.
///
/// Cloning shares the connection and the append broadcast.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    appended: broadcast::Sender<Appended>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        debug!(path = %path.display(), "opened sqlite store");
        Ok(Self::from_connection(conn, Some(path.to_path_buf())))
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn, None))
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        let (appended, _) = broadcast::channel(APPEND_CHANNEL_CAPACITY);
        Self {
            conn: Arc::new(Mutex::new(conn)),
            appended,
            path,
        }
    }

    /// Path of the database file, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&mut conn)
        })
        .await?
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metadata
    // ─────────────────────────────────────────────────────────────────────────

    /// Read a metadata value.
    pub async fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.blocking(move |conn| {
            conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    /// Set a metadata value.
    pub async fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").field("path", &self.path).finish()
    }
}

fn blob<const N: usize>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<[u8; N]> {
    let bytes: Vec<u8> = row.get(idx)?;
    bytes.try_into().map_err(|_| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Blob,
            format!("expected {N} bytes").into(),
        )
    })
}

const ENTRY_COLUMNS: &str =
    "version, author, log_key, seq, timestamp, prev, payload_hash, payload, signature";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entry> {
    let prev: Option<Vec<u8>> = row.get(5)?;
    let prev = match prev {
        Some(bytes) => Some(EntryId::from_bytes(bytes.try_into().map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(5, Type::Blob, "expected 32 bytes".into())
        })?)),
        None => None,
    };
    let payload: Vec<u8> = row.get(7)?;

    Ok(Entry {
        header: EntryHeader {
            version: row.get(0)?,
            author: DeviceId::from_bytes(blob(row, 1)?),
            log: LogKey::from_bytes(blob(row, 2)?),
            seq: row.get::<_, i64>(3)? as u64,
            timestamp: row.get(4)?,
            prev,
            payload_hash: Blake3Hash(blob(row, 6)?),
        },
        payload: Bytes::from(payload),
        signature: Signature(blob(row, 8)?),
    })
}

/// Length of the contiguous prefix of an ascending seq sequence.
fn contiguous(seqs: impl IntoIterator<Item = u64>) -> u64 {
    let mut length = 0;
    for seq in seqs {
        if seq != length + 1 {
            break;
        }
        length = seq;
    }
    length
}

#[async_trait]
impl LogStore for SqliteStore {
    async fn insert_entry(&self, entry: &Entry) -> Result<InsertResult> {
        let entry = entry.clone();
        let log = *entry.log();
        let seq = entry.seq();

        let result = self
            .blocking(move |conn| {
                let id = entry.compute_id();

                let existing: Option<Vec<u8>> = conn
                    .query_row(
                        "SELECT entry_id FROM entries WHERE log_key = ?1 AND seq = ?2",
                        params![entry.log().as_bytes().as_slice(), entry.seq() as i64],
                        |row| row.get(0),
                    )
                    .optional()?;

                if let Some(existing) = existing {
                    if existing.as_slice() == id.0.as_slice() {
                        return Ok(InsertResult::AlreadyExists);
                    }
                    let existing: [u8; 32] = existing
                        .try_into()
                        .map_err(|_| StoreError::InvalidData("entry id is not 32 bytes".into()))?;
                    return Ok(InsertResult::Conflict {
                        existing: EntryId::from_bytes(existing),
                    });
                }

                let header = &entry.header;
                conn.execute(
                    "INSERT INTO entries (
                        entry_id, log_key, seq, version, author, timestamp, prev,
                        payload_hash, payload, signature, ingested_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        id.0.as_slice(),
                        header.log.as_bytes().as_slice(),
                        header.seq as i64,
                        header.version,
                        header.author.as_bytes().as_slice(),
                        header.timestamp,
                        header.prev.as_ref().map(|p| p.0.to_vec()),
                        header.payload_hash.as_bytes().as_slice(),
                        entry.payload.as_ref(),
                        entry.signature.as_bytes().as_slice(),
                        now_millis(),
                    ],
                )?;

                Ok(InsertResult::Inserted)
            })
            .await?;

        if result == InsertResult::Inserted {
            let _ = self.appended.send(Appended { log, seq });
        }
        Ok(result)
    }

    async fn get_entry(&self, log: &LogKey, seq: u64) -> Result<Option<Entry>> {
        let log = *log;
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE log_key = ?1 AND seq = ?2"),
                params![log.as_bytes().as_slice(), seq as i64],
                row_to_entry,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_range(&self, log: &LogKey, start: u64, end: u64) -> Result<Vec<Entry>> {
        if start > end {
            return Ok(Vec::new());
        }
        let log = *log;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {ENTRY_COLUMNS} FROM entries
                 WHERE log_key = ?1 AND seq >= ?2 AND seq <= ?3 ORDER BY seq"
            ))?;
            let entries = stmt
                .query_map(
                    params![log.as_bytes().as_slice(), start as i64, end as i64],
                    row_to_entry,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(entries)
        })
        .await
    }

    async fn length(&self, log: &LogKey) -> Result<u64> {
        let log = *log;
        self.blocking(move |conn| {
            let mut stmt =
                conn.prepare("SELECT seq FROM entries WHERE log_key = ?1 ORDER BY seq")?;
            let seqs = stmt
                .query_map(params![log.as_bytes().as_slice()], |row| {
                    row.get::<_, i64>(0)
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(contiguous(seqs.into_iter().map(|s| s as u64)))
        })
        .await
    }

    async fn lengths(&self) -> Result<LogLengths> {
        self.blocking(move |conn| {
            let mut stmt = conn.prepare("SELECT log_key, seq FROM entries ORDER BY log_key, seq")?;
            let rows = stmt
                .query_map([], |row| Ok((blob::<32>(row, 0)?, row.get::<_, i64>(1)? as u64)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut lengths = LogLengths::new();
            let mut start = 0;
            while start < rows.len() {
                let key = rows[start].0;
                let end = rows[start..]
                    .iter()
                    .position(|(k, _)| *k != key)
                    .map_or(rows.len(), |p| start + p);
                let length = contiguous(rows[start..end].iter().map(|(_, s)| *s));
                lengths.insert(LogKey::from_bytes(key), length);
                start = end;
            }
            Ok(lengths)
        })
        .await
    }

    async fn downloaded_count(&self, log: &LogKey, from: u64, to: u64) -> Result<u64> {
        if from >= to {
            return Ok(0);
        }
        let log = *log;
        self.blocking(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM entries WHERE log_key = ?1 AND seq > ?2 AND seq <= ?3",
                params![log.as_bytes().as_slice(), from as i64, to as i64],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
        .await
    }

    async fn record_fork(&self, log: &LogKey, seq: u64, entry_id: &EntryId) -> Result<()> {
        let log = *log;
        let entry_id = *entry_id;
        self.blocking(move |conn| {
            debug!(%log, seq, %entry_id, "recording fork evidence");
            conn.execute(
                "INSERT OR IGNORE INTO forks (log_key, seq, entry_id, detected_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    log.as_bytes().as_slice(),
                    seq as i64,
                    entry_id.0.as_slice(),
                    now_millis()
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_forks(&self, log: &LogKey) -> Result<Vec<Fork>> {
        let log = *log;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, entry_id, detected_at FROM forks
                 WHERE log_key = ?1 ORDER BY seq, detected_at",
            )?;
            let forks = stmt
                .query_map(params![log.as_bytes().as_slice()], |row| {
                    Ok(Fork {
                        log,
                        seq: row.get::<_, i64>(0)? as u64,
                        entry_id: EntryId::from_bytes(blob(row, 1)?),
                        detected_at: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(forks)
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<Appended> {
        self.appended.subscribe()
    }
}

#[async_trait]
impl MediaStore for SqliteStore {
    async fn list(&self) -> Result<Vec<String>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM media ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(names)
        })
        .await
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let found: Option<i64> = conn
                .query_row("SELECT 1 FROM media WHERE name = ?1", params![name], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn read(&self, name: &str) -> Result<Option<Bytes>> {
        let name = name.to_string();
        self.blocking(move |conn| {
            let data: Option<Vec<u8>> = conn
                .query_row("SELECT data FROM media WHERE name = ?1", params![name], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(data.map(Bytes::from))
        })
        .await
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<()> {
        validate_media_name(name)?;
        let name = name.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO media (name, data, stored_at) VALUES (?1, ?2, ?3)",
                params![name, data.as_ref(), now_millis()],
            )?;
            Ok(())
        })
        .await
    }
}
