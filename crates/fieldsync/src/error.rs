//! Error types for the engine.

use fieldsync_core::{CoreError, LogKey};
use fieldsync_store::StoreError;
use fieldsync_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Core(#[from] CoreError),

    /// Announce or unannounce before `listen`.
    #[error("not listening")]
    NotListening,

    /// Discovery backend failure.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A local append collided with an entry already in the log.
    #[error("conflict in log {log} at seq {seq}")]
    Conflict { log: LogKey, seq: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
