//! # fieldsync store
//!
//! Storage behind the replication engine. Logs and media are consumed through
//! two narrow async traits so the same replication code runs against a live
//! device, a syncfile container or a plain directory.
//!
//! ## Key Types
//!
//! - [`LogStore`] - Append-only signed logs with fork evidence and an append broadcast
//! - [`MediaStore`] - Named binary blobs (`original/…`, `preview/…`, `thumbnail/…`)
//! - [`SqliteStore`] - Both stores in one SQLite file, plus a metadata table
//! - [`MemoryLogStore`] / [`MemoryMediaStore`] - In-memory stores for tests and unpacked snapshots
//! - [`FsMediaStore`] - Media as files under a directory
//!
//! ## Design Notes
//!
//! - **Idempotent inserts**: Inserting the same entry twice returns `AlreadyExists`
//! - **Fork evidence**: A different entry at an occupied position returns
//!   `Conflict`; callers record it with [`LogStore::record_fork`]
//! - **Length**: The number of contiguous entries from seq 1; gaps stop it

pub mod error;
pub mod fs;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use fs::FsMediaStore;
pub use memory::{MemoryLogStore, MemoryMediaStore};
pub use sqlite::SqliteStore;
pub use traits::{validate_media_name, Appended, Fork, InsertResult, LogStore, MediaStore};

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
