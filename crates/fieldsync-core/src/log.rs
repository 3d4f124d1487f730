//! Logs: ordered, append-only sequences of entries.
//!
//! A log is owned by a single device and identified by (author, log name).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::device::DeviceId;

/// A 32-byte log identifier.
///
/// Derived from Blake3(author || log_name).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogKey(pub [u8; 32]);

impl LogKey {
    /// Derive a log key from author and log name.
    pub fn derive(author: &DeviceId, log_name: &str) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"fieldsync-log-v1:");
        hasher.update(&author.0);
        hasher.update(b":");
        hasher.update(log_name.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LogKey({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for LogKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl TryFrom<&[u8]> for LogKey {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into()?))
    }
}

/// Length of every log a device holds, keyed by log.
///
/// Recomputed on demand from the store; used for progress accounting and for
/// deciding which entries each side is missing.
pub type LogLengths = BTreeMap<LogKey, u64>;
