//! # fieldsync
//!
//! Offline-first replication between devices holding copies of the same
//! project: signed append-only logs plus named media blobs.
//!
//! ## Overview
//!
//! - **Live sync**: Devices find each other on the local network, connect
//!   over TCP and run a session: handshake, then logs, then media
//! - **Syncfiles**: The same replication against a file or directory carried
//!   between devices
//! - **Progress**: Every session reports `{db, media}` counters and a state
//!   through its [`SyncHandle`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use fieldsync::{Engine, EngineConfig, ListenOptions, SyncOptions};
//! use fieldsync::core::{Keypair, ProjectKey};
//! use fieldsync::discovery::mdns::MdnsDiscovery;
//! use fieldsync::store::SqliteStore;
//!
//! async fn example() -> fieldsync::Result<()> {
//!     let store = Arc::new(SqliteStore::open("device.db")?);
//!     let config = EngineConfig::default();
//!     let discovery = MdnsDiscovery::new()?;
//!
//!     let engine = Engine::new(
//!         Keypair::generate(),
//!         ProjectKey::generate(),
//!         store.clone(),
//!         store,
//!         Arc::new(discovery),
//!         config,
//!     );
//!     engine.append("observations", "first sighting").await?;
//!     engine.listen(ListenOptions::default()).await?;
//!
//!     for target in engine.targets() {
//!         let summary = engine.sync_to_target(&target.id, SyncOptions::default()).wait().await?;
//!         println!("received {} entries", summary.logs.entries_received);
//!     }
//!
//!     engine.close().await
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `fieldsync::core` - Devices, entries, logs and project keys
//! - `fieldsync::store` - Log and media storage
//! - `fieldsync::sync` - Handshake, multiplexer, replication and sessions
//! - `fieldsync::syncfile` - Syncfile and directory containers

pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod server;
pub mod targets;

pub use fieldsync_core as core;
pub use fieldsync_store as store;
pub use fieldsync_sync as sync;
pub use fieldsync_syncfile as syncfile;

pub use config::{
    DiscoveryConfig, EngineConfig, ListenOptions, SyncOptions, DEFAULT_SERVICE_TYPE,
};
pub use discovery::{Announcement, Discovery, DiscoveryEvent};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use targets::{Target, TargetStatus, Targets};

pub use fieldsync_sync::{Progress, SessionState, SyncError, SyncHandle, SyncSummary};
