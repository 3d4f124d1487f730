//! Entry: a signed record appended to a log.
//!
//! An entry is immutable once signed. Edits are new entries; conflicting
//! entries at the same position are forks and are kept as evidence by the store.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::canonical::{canonical_bytes, signed_message_from_parts};
use crate::crypto::{Blake3Hash, Keypair, Signature};
use crate::device::DeviceId;
use crate::log::LogKey;

/// The current entry schema version.
pub const ENTRY_VERSION: u8 = 1;

/// A 32-byte entry identifier, computed as Blake3(canonical_bytes(entry)).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryId(pub [u8; 32]);

impl EntryId {
    /// Create a new EntryId from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

/// Metadata of an entry, covered by the signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryHeader {
    /// Schema version.
    pub version: u8,
    /// The writer of the log.
    pub author: DeviceId,
    /// The log this entry belongs to.
    pub log: LogKey,
    /// Position in the log (1-indexed).
    pub seq: u64,
    /// Author-claimed timestamp (Unix milliseconds). Untrusted.
    pub timestamp: i64,
    /// Id of the entry at `seq - 1` (None for the first entry).
    pub prev: Option<EntryId>,
    /// Blake3 hash of the payload bytes.
    pub payload_hash: Blake3Hash,
}

/// A complete entry: header, payload, signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub header: EntryHeader,
    pub payload: Bytes,
    pub signature: Signature,
}

impl Entry {
    /// Compute the content-addressed id of this entry.
    pub fn compute_id(&self) -> EntryId {
        EntryId(*Blake3Hash::hash(&canonical_bytes(self)).as_bytes())
    }

    pub fn log(&self) -> &LogKey {
        &self.header.log
    }

    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    pub fn author(&self) -> &DeviceId {
        &self.header.author
    }
}

/// Builder for signed entries.
#[derive(Debug, Clone)]
pub struct EntryBuilder {
    author: DeviceId,
    log: LogKey,
    seq: u64,
    timestamp: i64,
    prev: Option<EntryId>,
    payload: Bytes,
}

impl EntryBuilder {
    /// Start an entry at `seq` in `log`.
    pub fn new(author: DeviceId, log: LogKey, seq: u64) -> Self {
        Self {
            author,
            log,
            seq,
            timestamp: 0,
            prev: None,
            payload: Bytes::new(),
        }
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn prev(mut self, prev: EntryId) -> Self {
        self.prev = Some(prev);
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sign the entry with the author's keypair.
    pub fn sign(self, keypair: &Keypair) -> Entry {
        let header = EntryHeader {
            version: ENTRY_VERSION,
            author: self.author,
            log: self.log,
            seq: self.seq,
            timestamp: self.timestamp,
            prev: self.prev,
            payload_hash: Blake3Hash::hash(&self.payload),
        };
        let signature = keypair.sign(&signed_message_from_parts(&header, &self.payload));
        Entry {
            header,
            payload: self.payload,
            signature,
        }
    }
}
