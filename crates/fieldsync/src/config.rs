//! Engine configuration.

use std::net::{Ipv4Addr, SocketAddr};

use fieldsync_core::DeviceType;
use fieldsync_sync::SyncConfig;
use fieldsync_syncfile::SyncfileConfig;

/// Default discovery service type.
pub const DEFAULT_SERVICE_TYPE: &str = "_fieldsync._tcp";

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Name shown to other devices.
    pub device_name: String,
    pub device_type: DeviceType,
    /// Live sync configuration.
    pub sync: SyncConfig,
    /// Syncfile and directory replication.
    pub syncfile: SyncfileConfig,
    pub discovery: DiscoveryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_name: "fieldsync device".to_string(),
            device_type: DeviceType::Desktop,
            sync: SyncConfig::default(),
            syncfile: SyncfileConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

/// Configuration for peer discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Service type advertised and browsed for.
    pub service_type: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
        }
    }
}

/// Options for [`Engine::listen`](crate::Engine::listen).
#[derive(Debug, Clone)]
pub struct ListenOptions {
    /// Address the replication server binds to. Port 0 picks a free port.
    pub addr: SocketAddr,
    /// Host other devices should connect to. Defaults to the bound address.
    pub advertised_host: Option<String>,
    /// Announce right away.
    pub announce: bool,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            advertised_host: None,
            announce: true,
        }
    }
}

/// Options for [`Engine::sync_to_target`](crate::Engine::sync_to_target).
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Overrides the engine's sync configuration for this session.
    pub sync: Option<SyncConfig>,
}
