//! Peer discovery.
//!
//! A device announces where its replication server listens and browses for
//! announcements of others. Backends report peers coming `up` and going
//! `down`; the engine drops its own announcements.
//!
//! Two backends are provided: [`mdns`] registers and browses DNS-SD services
//! on the local network, [`memory`] connects handles in one process for tests.

pub mod mdns;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use fieldsync_core::DeviceType;

use crate::error::Result;

/// Where and what a device is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Announcement {
    /// Unique name; the device id in hex.
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub service_type: String,
    pub device_name: String,
    pub device_type: DeviceType,
}

/// A change in the set of visible peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    Up(Announcement),
    Down { name: String },
}

/// Discovery backend.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Start (or replace) this device's announcement.
    async fn announce(&self, announcement: Announcement) -> Result<()>;

    /// Withdraw the announcement. A no-op if nothing is announced.
    async fn unannounce(&self) -> Result<()>;

    /// Start browsing. Events for peers already visible are delivered first.
    /// The receiver ends when browsing stops.
    async fn browse(&self, service_type: &str) -> Result<mpsc::UnboundedReceiver<DiscoveryEvent>>;

    /// Stop browsing.
    async fn stop_browsing(&self) -> Result<()>;
}
