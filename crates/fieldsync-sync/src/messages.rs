//! Replication message types.
//!
//! Every sub-stream after the handshake carries CBOR-encoded messages, one
//! per frame. The handshake itself is JSON (see [`crate::handshake`]).

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use fieldsync_core::{Entry, LogKey};

use crate::error::{ProtocolError, Result, SyncError};

/// Current protocol version, exchanged in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Message size limits.
pub mod limits {
    /// Max logs in one `Have` message.
    pub const MAX_HEADS_PER_MESSAGE: usize = 1000;
    /// Max entries in one `Entries` message.
    pub const MAX_ENTRIES_PER_MESSAGE: usize = 50;
    /// Max names in one `Catalog` or `Want` message.
    pub const MAX_NAMES_PER_MESSAGE: usize = 500;
    /// Max bytes of blob data in one `Chunk` message.
    pub const MAX_BLOB_CHUNK: usize = 1024 * 1024;
    /// Max size of a single frame on the wire.
    pub const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;
    /// Messages in flight per direction of one sub-stream.
    pub const STREAM_WINDOW: usize = 16;
}

/// Messages on the `db` sub-stream.
///
/// ```text
/// A                       B
///   |-- Have* ----------->|
///   |-- EndOfHeads ------>|
///   |<----------- Have* --|
///   |<------ EndOfHeads --|
///   |-- Entries* -------->|   entries B is missing
///   |<--------- Entries* -|   entries A is missing
///   |-- Have*, Entries* ->|   logs A appended to since its heads
///   |-- Done ------------>|
///   |<------------ Done --|
///   |-- Synced ---------->|   everything B sent is stored
///   |<---------- Synced --|
/// ```
///
/// Each side sends `Synced` after the remote's `Done`, so receiving it means
/// the remote has ingested every entry sent before our own `Done`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogMessage {
    /// A chunk of the sender's log lengths. After `EndOfHeads` it announces
    /// logs that grew during the session.
    Have { logs: Vec<(LogKey, u64)> },
    /// All lengths have been sent.
    EndOfHeads,
    /// Entries the receiver lacks, ordered by seq within each log.
    Entries { entries: Vec<Entry> },
    /// The sender has nothing more to upload.
    Done,
    /// Sent after the remote's `Done`: all of its entries are stored.
    Synced,
}

impl LogMessage {
    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), ProtocolError> {
        match self {
            LogMessage::Have { logs } if logs.len() > limits::MAX_HEADS_PER_MESSAGE => {
                Err(ProtocolError::LimitExceeded("too many log heads"))
            }
            LogMessage::Entries { entries } if entries.len() > limits::MAX_ENTRIES_PER_MESSAGE => {
                Err(ProtocolError::LimitExceeded("too many entries"))
            }
            _ => Ok(()),
        }
    }
}

/// Messages on the `media` sub-stream.
///
/// Blobs travel as a run of `Chunk`s at increasing offsets, the last one
/// flagged. A side says `Done` once the remote has finished asking, every
/// requested blob has been sent and every blob it asked for has arrived or
/// been reported `Unavailable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaMessage {
    /// A chunk of names the sender is willing to give the receiver.
    Catalog { names: Vec<String> },
    EndOfCatalog,
    /// A chunk of names the sender wants from the receiver's catalog.
    Want { names: Vec<String> },
    EndOfWants,
    /// Part of one requested blob, starting at `offset`.
    Chunk {
        name: String,
        offset: u64,
        data: Bytes,
        last: bool,
    },
    /// Requested names the sender will not serve.
    Unavailable { names: Vec<String> },
    /// Every wanted blob has been sent and every requested one received.
    Done,
}

impl MediaMessage {
    pub fn validate_limits(&self) -> std::result::Result<(), ProtocolError> {
        match self {
            MediaMessage::Catalog { names }
            | MediaMessage::Want { names }
            | MediaMessage::Unavailable { names }
                if names.len() > limits::MAX_NAMES_PER_MESSAGE =>
            {
                Err(ProtocolError::LimitExceeded("too many media names"))
            }
            MediaMessage::Chunk { data, .. } if data.len() > limits::MAX_BLOB_CHUNK => {
                Err(ProtocolError::LimitExceeded("blob chunk too large"))
            }
            _ => Ok(()),
        }
    }
}

/// Messages on the `rpc` sub-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Initiator asks the responder to get ready for replication.
    Arm,
    /// Responder is ready.
    Armed,
}

/// Encode a message as CBOR.
pub fn encode<T: Serialize>(message: &T) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| SyncError::Codec(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a CBOR message.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes)
        .map_err(|e| SyncError::Protocol(ProtocolError::Malformed(e.to_string())))
}
