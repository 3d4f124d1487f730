//! # fieldsync core
//!
//! Pure primitives shared by every fieldsync crate: device identities, logs,
//! signed entries and project keys.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`DeviceId`] - Identity of a device (its Ed25519 public key)
//! - [`LogKey`] - Identifier of an append-only log owned by one device
//! - [`Entry`] - A signed record appended to a log
//! - [`LogLengths`] - Per-log length table, the input of progress accounting
//! - [`ProjectKey`] - Shared secret identifying a project; never logged in full

pub mod canonical;
pub mod crypto;
pub mod device;
pub mod entry;
pub mod error;
pub mod log;
pub mod project;
pub mod validation;

pub use canonical::{canonical_bytes, canonical_header_bytes, signed_message};
pub use crypto::{Blake3Hash, Keypair, Signature};
pub use device::{DeviceId, DeviceType};
pub use entry::{Entry, EntryBuilder, EntryHeader, EntryId, ENTRY_VERSION};
pub use error::{CoreError, ValidationError};
pub use log::{LogKey, LogLengths};
pub use project::{redact, DiscoveryKey, ProjectKey};
pub use validation::{validate_entry, validate_entry_structure, validate_link};
