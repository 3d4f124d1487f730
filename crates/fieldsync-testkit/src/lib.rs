//! # fieldsync testkit
//!
//! Testing utilities for fieldsync.
//!
//! - **Fixtures**: devices with deterministic keys and in-memory stores
//! - **Generators**: proptest strategies for ids, log tables and media names
//!
//! ```rust
//! use fieldsync_testkit::fixtures::TestDevice;
//!
//! let device = TestDevice::new(1);
//! let entries = device.chain("observations", 3);
//! assert_eq!(entries.len(), 3);
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{blob, devices, TestDevice};
