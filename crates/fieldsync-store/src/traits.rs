//! Store traits: the abstract interface replication runs against.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

use fieldsync_core::{Entry, EntryId, LogKey, LogLengths};

use crate::error::{Result, StoreError};

/// Result of inserting an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    /// Entry was inserted successfully.
    Inserted,
    /// Entry already exists (idempotent - not an error).
    AlreadyExists,
    /// A different entry already occupies this log position.
    Conflict {
        /// The id of the entry kept at this position.
        existing: EntryId,
    },
}

/// Evidence of a fork in a log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fork {
    /// The log where the fork was detected.
    pub log: LogKey,
    /// The position where the fork occurred.
    pub seq: u64,
    /// The rejected entry's id.
    pub entry_id: EntryId,
    /// When the fork was detected (Unix ms).
    pub detected_at: i64,
}

/// Notification that an entry landed in a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    pub log: LogKey,
    pub seq: u64,
}

/// Capacity of every store's append broadcast.
pub(crate) const APPEND_CHANNEL_CAPACITY: usize = 1024;

/// Append-only log storage.
///
/// All methods are async; SQLite-backed implementations move work onto the
/// blocking pool. Writers are serialized by the implementation.
#[async_trait]
pub trait LogStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Entry Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Insert an entry.
    ///
    /// # Returns
    /// - `Inserted` if the entry was new.
    /// - `AlreadyExists` if the exact same entry is already stored.
    /// - `Conflict` if a different entry exists at the same position.
    async fn insert_entry(&self, entry: &Entry) -> Result<InsertResult>;

    /// Get the entry at a position in a log.
    async fn get_entry(&self, log: &LogKey, seq: u64) -> Result<Option<Entry>>;

    /// Get entries with `start <= seq <= end`, ordered by seq. Missing
    /// positions are skipped.
    async fn get_range(&self, log: &LogKey, start: u64, end: u64) -> Result<Vec<Entry>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Lengths
    // ─────────────────────────────────────────────────────────────────────────

    /// Number of contiguous entries from seq 1.
    async fn length(&self, log: &LogKey) -> Result<u64>;

    /// Length of every known log.
    async fn lengths(&self) -> Result<LogLengths>;

    /// Number of stored entries whose zero-based index lies in `[from, to)`,
    /// i.e. entries with `from < seq <= to`.
    async fn downloaded_count(&self, log: &LogKey, from: u64, to: u64) -> Result<u64>;

    // ─────────────────────────────────────────────────────────────────────────
    // Fork Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Record evidence of a fork. Recording the same evidence twice is a no-op.
    async fn record_fork(&self, log: &LogKey, seq: u64, entry_id: &EntryId) -> Result<()>;

    /// Get all fork evidence for a log.
    async fn get_forks(&self, log: &LogKey) -> Result<Vec<Fork>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Notifications
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to entry insertions. Dropping the receiver unsubscribes.
    fn subscribe(&self) -> broadcast::Receiver<Appended>;
}

/// Named blob storage.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// All blob names, sorted.
    async fn list(&self) -> Result<Vec<String>>;

    async fn exists(&self, name: &str) -> Result<bool>;

    async fn read(&self, name: &str) -> Result<Option<Bytes>>;

    /// Store a blob. Blobs are immutable: writing an existing name replaces
    /// it with identical content in practice.
    async fn write(&self, name: &str, data: Bytes) -> Result<()>;
}

/// Check that a media name is relative, non-empty and stays inside the store.
pub fn validate_media_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.contains('\0')
        || name.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StoreError::InvalidMediaName(name.to_string()));
    }
    Ok(())
}
