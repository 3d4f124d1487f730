//! # fieldsync sync
//!
//! Peer sync protocol for fieldsync.
//!
//! A session runs over one connection wrapped in a [`Mux`]:
//!
//! 1. **Handshake** on the `handshake` sub-stream: both devices send a
//!    [`HandshakePayload`] and answer the other's with accept or reject
//! 2. **Arm**: the initiator (smaller device id) sends `Arm` on `rpc`
//! 3. **Logs** on `db`: exchange log lengths, upload what the other lacks
//! 4. **Media** on `media`: exchange catalogs filtered for the remote device,
//!    request missing blobs
//!
//! Progress is accounted per session and published through a
//! [`SyncHandle`] at most once per interval.
//!
//! ## Transport Agnostic
//!
//! Replication talks to a [`Channel`]. Live sessions use mux sub-streams;
//! syncfile replication uses in-process [`memory`] pairs.

pub mod channel;
pub mod error;
pub mod handshake;
pub mod media;
pub mod messages;
pub mod mux;
pub mod progress;
pub mod replication;
pub mod session;

pub use channel::{memory, Channel, Event};
pub use error::{ErrorKind, MuxError, ProtocolError, Result, Side, SyncError};
pub use handshake::{handshake, Accept, HandshakeMessage, HandshakeOutcome, HandshakePayload};
pub use media::{offered_to, replicate_media, MediaStats};
pub use messages::{ControlMessage, LogMessage, MediaMessage, PROTOCOL_VERSION};
pub use mux::{Mux, SubStream};
pub use progress::{expected_transfer, Counter, ExpectedTransfer, Progress, ProgressReporter};
pub use replication::{replicate_logs, LogStats};
pub use session::{
    start, streams, Role, Session, SessionState, SessionTracker, SyncConfig, SyncHandle,
    SyncSummary,
};
