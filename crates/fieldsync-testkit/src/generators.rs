//! Proptest generators for property-based testing.

use proptest::prelude::*;

use fieldsync_core::{DeviceId, DeviceType, Keypair, LogKey, LogLengths};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a random DeviceId.
pub fn device_id() -> impl Strategy<Value = DeviceId> {
    any::<[u8; 32]>().prop_map(DeviceId::from_bytes)
}

pub fn device_type() -> impl Strategy<Value = DeviceType> {
    prop_oneof![Just(DeviceType::Desktop), Just(DeviceType::Mobile)]
}

/// Keys drawn from a small pool so that generated tables overlap.
pub fn log_key() -> impl Strategy<Value = LogKey> {
    (0u8..16).prop_map(|b| LogKey::from_bytes([b; 32]))
}

/// A log length table with up to `max_logs` logs.
pub fn log_lengths(max_logs: usize) -> impl Strategy<Value = LogLengths> {
    prop::collection::btree_map(log_key(), 0u64..10_000, 0..=max_logs)
}

/// Generate a log name.
pub fn log_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,31}".prop_map(String::from)
}

/// A media name under one of the usual prefixes.
pub fn media_name() -> impl Strategy<Value = String> {
    (
        prop_oneof![Just("original"), Just("preview"), Just("thumbnail")],
        "[a-z0-9]{1,12}",
    )
        .prop_map(|(prefix, stem)| format!("{prefix}/{stem}.jpg"))
}

/// Generate payload bytes of specified max length.
pub fn payload(max_len: usize) -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..=max_len)
}
