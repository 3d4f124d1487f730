//! Device identity and device classes.

use ed25519_dalek::{Signature as DalekSignature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::crypto::Signature;
use crate::error::CoreError;

/// Identity of a device: its 32-byte Ed25519 public key.
///
/// Serialized as lowercase hex so it reads the same in JSON handshakes,
/// discovery records and CBOR messages. Ordering is byte-wise, which matches
/// the lexicographic order of the hex form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub [u8; 32]);

impl DeviceId {
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

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|e| CoreError::MalformedDeviceId(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::MalformedDeviceId("expected 32 bytes".into()))?;
        Ok(Self(arr))
    }

    /// Verify a signature made by this device over a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CoreError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CoreError::InvalidPublicKey)?;
        verifying_key
            .verify(message, &DalekSignature::from_bytes(&signature.0))
            .map_err(|_| CoreError::InvalidSignature)
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl FromStr for DeviceId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for DeviceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DeviceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Class of device, declared in the handshake.
///
/// The remote's device type parameterizes media filtering: mobile peers are
/// not sent full-resolution originals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Desktop,
    Mobile,
    /// Anything this version does not know about; treated like a desktop.
    #[serde(other)]
    Unknown,
}

impl DeviceType {
    /// Check if this is a mobile device.
    pub fn is_mobile(self) -> bool {
        matches!(self, Self::Mobile)
    }

    /// Wire name of the device type.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Desktop => "desktop",
            Self::Mobile => "mobile",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_hex_roundtrip() {
        let id = DeviceId::from_bytes([0x42; 32]);
        assert_eq!(DeviceId::from_hex(&id.to_hex()).unwrap(), id);
    }

    #[test]
    fn test_device_id_json_is_hex_string() {
        let id = DeviceId::from_bytes([0xab; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: DeviceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_device_id_order_matches_hex_order() {
        let a = DeviceId::from_bytes([0x01; 32]);
        let b = DeviceId::from_bytes([0x02; 32]);
        assert!(a < b);
        assert!(a.to_hex() < b.to_hex());
    }

    #[test]
    fn test_device_type_wire_names() {
        assert_eq!(serde_json::to_string(&DeviceType::Mobile).unwrap(), "\"mobile\"");
        let t: DeviceType = serde_json::from_str("\"toaster\"").unwrap();
        assert_eq!(t, DeviceType::Unknown);
    }
}
