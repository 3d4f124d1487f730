//! Project keys.
//!
//! A project key is the shared secret that makes two devices members of the
//! same project. It never leaves the device: peers compare a [`DiscoveryKey`]
//! derived from it instead, and error messages only carry a short prefix.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Number of characters of a malformed key kept in error messages.
const REDACTED_PREFIX_LEN: usize = 8;

/// A 32-byte project secret.
#[derive(Clone, PartialEq, Eq)]
pub struct ProjectKey([u8; 32]);

impl ProjectKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random project key.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a project key from its 64-character hex form.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let malformed = || CoreError::MalformedProjectKey {
            prefix: redact(s),
        };
        let bytes = hex::decode(s.trim()).map_err(|_| malformed())?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| malformed())?;
        Ok(Self(arr))
    }

    /// The public identifier of the project, safe to announce and exchange.
    pub fn discovery_key(&self) -> DiscoveryKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"fieldsync-discovery-v1:");
        hasher.update(&self.0);
        DiscoveryKey(*hasher.finalize().as_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProjectKey({})", redact(&self.to_hex()))
    }
}

impl FromStr for ProjectKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Short, non-secret form of a key for messages: an 8-char prefix and `…`.
pub fn redact(s: &str) -> String {
    let prefix: String = s.chars().take(REDACTED_PREFIX_LEN).collect();
    format!("{prefix}…")
}

/// Hash of a project key. Two devices share a project iff their discovery
/// keys are equal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveryKey(pub [u8; 32]);

impl DiscoveryKey {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|e| CoreError::DecodingError(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::DecodingError("discovery key must be 32 bytes".into()))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", &self.to_hex()[..16])
    }
}

impl Serialize for DiscoveryKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DiscoveryKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roundtrip() {
        let key = ProjectKey::generate();
        assert_eq!(ProjectKey::parse(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn test_malformed_key_is_redacted() {
        let input = "0123456789abcdefXYZ";
        let err = ProjectKey::parse(input).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("01234567…"));
        assert!(!msg.contains("89abcdef"));
    }

    #[test]
    fn test_debug_does_not_leak_key() {
        let key = ProjectKey::from_bytes([0xcd; 32]);
        let debug = format!("{key:?}");
        assert!(!debug.contains(&key.to_hex()));
        assert!(debug.contains("cdcdcdcd…"));
    }

    #[test]
    fn test_discovery_key_differs_from_key() {
        let key = ProjectKey::from_bytes([1; 32]);
        assert_ne!(key.discovery_key().0, [1; 32]);
        assert_eq!(key.discovery_key(), ProjectKey::from_bytes([1; 32]).discovery_key());
    }
}
