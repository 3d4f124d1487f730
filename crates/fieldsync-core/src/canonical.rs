//! Canonical CBOR encoding for deterministic serialization.
//!
//! Headers are encoded as CBOR maps with small integer keys in ascending
//! order, definite lengths and minimal integer encodings, so the same entry
//! produces the same bytes (and id) on every device.

use ciborium::value::Value;

use crate::entry::{Entry, EntryHeader};

/// Header field keys. Keys 0-23 encode as single bytes in CBOR.
mod keys {
    pub const VERSION: u64 = 0;
    pub const AUTHOR: u64 = 1;
    pub const LOG: u64 = 2;
    pub const SEQ: u64 = 3;
    pub const TIMESTAMP: u64 = 4;
    pub const PREV: u64 = 5;
    pub const PAYLOAD_HASH: u64 = 6;
}

/// Encode an entry header to canonical CBOR bytes.
pub fn canonical_header_bytes(header: &EntryHeader) -> Vec<u8> {
    let prev = match &header.prev {
        Some(id) => Value::Bytes(id.0.to_vec()),
        None => Value::Null,
    };

    let value = Value::Map(vec![
        (key(keys::VERSION), Value::Integer(header.version.into())),
        (key(keys::AUTHOR), Value::Bytes(header.author.0.to_vec())),
        (key(keys::LOG), Value::Bytes(header.log.0.to_vec())),
        (key(keys::SEQ), Value::Integer(header.seq.into())),
        (key(keys::TIMESTAMP), Value::Integer(header.timestamp.into())),
        (key(keys::PREV), prev),
        (key(keys::PAYLOAD_HASH), Value::Bytes(header.payload_hash.0.to_vec())),
    ]);

    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = ciborium::into_writer(&value, &mut buf);
    buf
}

/// Encode an entire entry: canonical_header || payload || signature.
pub fn canonical_bytes(entry: &Entry) -> Vec<u8> {
    let mut buf = signed_message(entry);
    buf.extend_from_slice(&entry.signature.0);
    buf
}

/// The bytes covered by the signature: canonical_header || payload.
pub fn signed_message(entry: &Entry) -> Vec<u8> {
    signed_message_from_parts(&entry.header, &entry.payload)
}

/// The signed message from header and payload.
pub fn signed_message_from_parts(header: &EntryHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = canonical_header_bytes(header);
    buf.extend_from_slice(payload);
    buf
}

fn key(k: u64) -> Value {
    Value::Integer(k.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Blake3Hash;
    use crate::device::DeviceId;
    use crate::log::LogKey;

    fn header(seq: u64) -> EntryHeader {
        let author = DeviceId::from_bytes([9; 32]);
        EntryHeader {
            version: 1,
            author,
            log: LogKey::derive(&author, "default"),
            seq,
            timestamp: 42,
            prev: None,
            payload_hash: Blake3Hash::hash(b""),
        }
    }

    #[test]
    fn test_header_encoding_is_stable() {
        assert_eq!(canonical_header_bytes(&header(1)), canonical_header_bytes(&header(1)));
        assert_ne!(canonical_header_bytes(&header(1)), canonical_header_bytes(&header(2)));
    }

    #[test]
    fn test_header_is_a_seven_entry_map() {
        let bytes = canonical_header_bytes(&header(1));
        // major type 5 (map), length 7
        assert_eq!(bytes[0], 0xa7);
        // first key is the integer 0
        assert_eq!(bytes[1], 0x00);
    }
}
