//! Error types for fieldsync core.

use thiserror::Error;

use crate::entry::EntryId;

/// Core errors raised while building, encoding or identifying entries.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    /// The key is never included verbatim; only a short prefix is kept.
    #[error("malformed project key: {prefix}")]
    MalformedProjectKey { prefix: String },

    #[error("malformed device id: {0}")]
    MalformedDeviceId(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors for entry structure and signatures.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("signature verification failed")]
    SignatureFailed,

    #[error("payload hash does not match header")]
    PayloadHashMismatch,

    #[error("unsupported entry version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid prev entry at seq {seq}: expected {expected:?}, got {got:?}")]
    InvalidPrev {
        seq: u64,
        expected: Option<EntryId>,
        got: Option<EntryId>,
    },

    #[error("log key does not belong to author")]
    ForeignLog,

    #[error("structural error: {0}")]
    StructuralError(String),
}

impl From<CoreError> for ValidationError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::InvalidSignature | CoreError::InvalidPublicKey => {
                ValidationError::SignatureFailed
            }
            other => ValidationError::StructuralError(other.to_string()),
        }
    }
}
