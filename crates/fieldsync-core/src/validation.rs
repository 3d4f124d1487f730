//! Entry validation: signature verification and structural checks.

use crate::canonical::signed_message;
use crate::crypto::Blake3Hash;
use crate::entry::{Entry, EntryId, ENTRY_VERSION};
use crate::error::ValidationError;

/// Validate an entry on its own, without looking at the rest of its log.
///
/// Checks, in order:
/// - schema version
/// - payload hash
/// - sequence structure (seq starts at 1; only seq 1 may omit `prev`)
/// - signature by the declared author
pub fn validate_entry(entry: &Entry) -> Result<(), ValidationError> {
    validate_entry_structure(entry)?;

    let message = signed_message(entry);
    entry
        .header
        .author
        .verify(&message, &entry.signature)
        .map_err(|_| ValidationError::SignatureFailed)?;

    Ok(())
}

/// Structural checks only, skipping the signature.
///
/// Used when reading back entries from trusted local storage.
pub fn validate_entry_structure(entry: &Entry) -> Result<(), ValidationError> {
    let header = &entry.header;

    if header.version != ENTRY_VERSION {
        return Err(ValidationError::UnsupportedVersion(header.version));
    }

    if Blake3Hash::hash(&entry.payload) != header.payload_hash {
        return Err(ValidationError::PayloadHashMismatch);
    }

    if header.seq == 0 {
        return Err(ValidationError::StructuralError("seq starts at 1".into()));
    }

    if header.seq == 1 && header.prev.is_some() {
        return Err(ValidationError::InvalidPrev {
            seq: 1,
            expected: None,
            got: header.prev,
        });
    }

    if header.seq > 1 && header.prev.is_none() {
        return Err(ValidationError::StructuralError(
            "seq > 1 requires prev".into(),
        ));
    }

    Ok(())
}

/// Check that `entry` correctly follows `prev` in the same log.
pub fn validate_link(prev: &Entry, entry: &Entry) -> Result<(), ValidationError> {
    if prev.header.log != entry.header.log || prev.header.author != entry.header.author {
        return Err(ValidationError::ForeignLog);
    }

    let expected: EntryId = prev.compute_id();
    if entry.header.seq != prev.header.seq + 1 || entry.header.prev != Some(expected) {
        return Err(ValidationError::InvalidPrev {
            seq: entry.header.seq,
            expected: Some(expected),
            got: entry.header.prev,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use crate::entry::EntryBuilder;
    use crate::log::LogKey;

    fn chain(keypair: &Keypair, n: u64) -> Vec<Entry> {
        let author = keypair.device_id();
        let log = LogKey::derive(&author, "default");
        let mut out: Vec<Entry> = Vec::new();
        for seq in 1..=n {
            let mut builder = EntryBuilder::new(author, log, seq).payload(format!("entry {seq}"));
            if let Some(last) = out.last() {
                builder = builder.prev(last.compute_id());
            }
            out.push(builder.sign(keypair));
        }
        out
    }

    #[test]
    fn test_valid_chain() {
        let keypair = Keypair::generate();
        let entries = chain(&keypair, 3);
        for entry in &entries {
            validate_entry(entry).unwrap();
        }
        validate_link(&entries[0], &entries[1]).unwrap();
        validate_link(&entries[1], &entries[2]).unwrap();
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let keypair = Keypair::generate();
        let mut entry = chain(&keypair, 1).remove(0);
        entry.payload = bytes::Bytes::from_static(b"tampered");
        assert!(matches!(
            validate_entry(&entry),
            Err(ValidationError::PayloadHashMismatch)
        ));
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let author = keypair.device_id();
        let entry = EntryBuilder::new(author, LogKey::derive(&author, "default"), 1)
            .payload("x")
            .sign(&other);
        assert!(matches!(
            validate_entry(&entry),
            Err(ValidationError::SignatureFailed)
        ));
    }

    #[test]
    fn test_missing_prev_rejected() {
        let keypair = Keypair::generate();
        let author = keypair.device_id();
        let entry = EntryBuilder::new(author, LogKey::derive(&author, "default"), 2)
            .payload("x")
            .sign(&keypair);
        assert!(matches!(
            validate_entry(&entry),
            Err(ValidationError::StructuralError(_))
        ));
    }

    #[test]
    fn test_link_to_wrong_prev_rejected() {
        let keypair = Keypair::generate();
        let entries = chain(&keypair, 3);
        assert!(matches!(
            validate_link(&entries[0], &entries[2]),
            Err(ValidationError::InvalidPrev { seq: 3, .. })
        ));
    }
}
