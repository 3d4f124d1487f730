//! Error types for the sync module.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fieldsync_core::CoreError;

/// Violations of the handshake and replication wire protocols.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The remote answered before telling us who it is.
    #[error("received handshake response before payload")]
    ResponseBeforePayload,

    /// A message that may arrive at most once arrived twice.
    #[error("duplicate {0} message")]
    DuplicateMessage(&'static str),

    #[error("unknown message type: {0:?}")]
    UnknownMessageType(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    /// A well-formed message that is not valid in the current phase.
    #[error("unexpected message: {0}")]
    Unexpected(String),

    #[error("message exceeds limits: {0}")]
    LimitExceeded(&'static str),
}

/// Errors raised by the stream multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MuxError {
    /// The underlying connection failed or reached EOF.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The multiplexer was closed locally.
    #[error("multiplexer closed")]
    Closed,

    #[error("sub-stream {0:?} is already open")]
    AlreadyOpen(String),

    #[error("sub-stream name too long: {0} bytes")]
    NameTooLong(usize),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No known target has this id.
    #[error("peer not found: {0}")]
    PeerNotFound(String),

    /// The two devices belong to different projects.
    #[error("incompatible projects")]
    IncompatibleProjects,

    /// Replication was started before both sides accepted the handshake.
    #[error("replication started before handshake completed")]
    PrematureSync,

    #[error("unsupported syncfile: {0}")]
    UnsupportedSyncfile(String),

    /// The transport went away mid-session.
    #[error("connection lost")]
    ConnectionLost,

    #[error("sync error: {0}")]
    Sync(String),

    /// Only an 8-character prefix of the key is ever kept.
    #[error("malformed project key: {prefix}")]
    MalformedProjectKey { prefix: String },

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("protocol version mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },

    /// One side declined the handshake.
    #[error("sync rejected by {by}")]
    Rejected { by: Side },

    #[error("store error: {0}")]
    Store(#[from] fieldsync_store::StoreError),

    #[error("validation error: {0}")]
    Validation(#[from] fieldsync_core::ValidationError),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which end of a session made a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Side::Local => "local device",
            Side::Remote => "remote device",
        })
    }
}

/// Data-free classification of a [`SyncError`], used in session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    PeerNotFound,
    IncompatibleProjects,
    PrematureSync,
    UnsupportedSyncfile,
    ConnectionLost,
    Sync,
    MalformedProjectKey,
    Protocol,
    VersionMismatch,
    Rejected,
    Store,
    Validation,
    Codec,
    Io,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::PeerNotFound(_) => ErrorKind::PeerNotFound,
            SyncError::IncompatibleProjects => ErrorKind::IncompatibleProjects,
            SyncError::PrematureSync => ErrorKind::PrematureSync,
            SyncError::UnsupportedSyncfile(_) => ErrorKind::UnsupportedSyncfile,
            SyncError::ConnectionLost => ErrorKind::ConnectionLost,
            SyncError::Sync(_) => ErrorKind::Sync,
            SyncError::MalformedProjectKey { .. } => ErrorKind::MalformedProjectKey,
            SyncError::Protocol(_) => ErrorKind::Protocol,
            SyncError::VersionMismatch { .. } => ErrorKind::VersionMismatch,
            SyncError::Rejected { .. } => ErrorKind::Rejected,
            SyncError::Store(_) => ErrorKind::Store,
            SyncError::Validation(_) => ErrorKind::Validation,
            SyncError::Codec(_) => ErrorKind::Codec,
            SyncError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<MuxError> for SyncError {
    fn from(e: MuxError) -> Self {
        match e {
            MuxError::ConnectionLost(_) | MuxError::Closed => SyncError::ConnectionLost,
            MuxError::AlreadyOpen(name) => SyncError::Sync(format!("sub-stream {name} already open")),
            MuxError::NameTooLong(_) | MuxError::MalformedFrame(_) => {
                SyncError::Protocol(ProtocolError::Malformed(e.to_string()))
            }
        }
    }
}

impl From<CoreError> for SyncError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::MalformedProjectKey { prefix } => SyncError::MalformedProjectKey { prefix },
            other => SyncError::Codec(other.to_string()),
        }
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
