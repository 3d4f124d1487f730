//! Known sync targets.
//!
//! A target is created when discovery reports a peer up, updated in place
//! while a session with it runs, and removed when the peer goes down.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use fieldsync_core::DeviceType;
use fieldsync_sync::SessionState;

use crate::discovery::Announcement;

/// Sync status of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetStatus {
    #[default]
    Idle,
    ReplicationStarted,
    /// Log replication is running.
    OsmConnected,
    /// Media replication is running.
    MediaConnected,
    ReplicationComplete,
    ReplicationError,
}

impl From<SessionState> for TargetStatus {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Connecting | SessionState::Handshaking => Self::ReplicationStarted,
            SessionState::SyncingDb => Self::OsmConnected,
            SessionState::SyncingMedia => Self::MediaConnected,
            SessionState::Complete => Self::ReplicationComplete,
            SessionState::Error(_) => Self::ReplicationError,
        }
    }
}

/// A discovered device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Announcement name; the device id in hex.
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub status: TargetStatus,
    #[serde(rename = "type")]
    pub device_type: DeviceType,
}

impl Target {
    fn from_announcement(a: &Announcement) -> Self {
        Self {
            id: a.name.clone(),
            name: a.device_name.clone(),
            host: a.host.clone(),
            port: a.port,
            status: TargetStatus::Idle,
            device_type: a.device_type,
        }
    }
}

/// Shared target table.
#[derive(Debug, Clone, Default)]
pub struct Targets {
    inner: Arc<RwLock<BTreeMap<String, Target>>>,
}

impl Targets {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Target>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Target>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a target, or refresh its address keeping its status.
    pub fn upsert(&self, announcement: &Announcement) {
        let mut targets = self.write();
        let fresh = Target::from_announcement(announcement);
        match targets.get_mut(&fresh.id) {
            Some(existing) => {
                existing.name = fresh.name;
                existing.host = fresh.host;
                existing.port = fresh.port;
                existing.device_type = fresh.device_type;
            }
            None => {
                debug!(target_id = %fresh.id, host = %fresh.host, port = fresh.port, "target up");
                targets.insert(fresh.id.clone(), fresh);
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<Target> {
        let removed = self.write().remove(id);
        if removed.is_some() {
            debug!(target_id = %id, "target down");
        }
        removed
    }

    /// Update a target's status. Unknown ids are ignored.
    pub fn set_status(&self, id: &str, status: TargetStatus) {
        if let Some(target) = self.write().get_mut(id) {
            target.status = status;
        }
    }

    pub fn get(&self, id: &str) -> Option<Target> {
        self.read().get(id).cloned()
    }

    /// All targets, ordered by id.
    pub fn list(&self) -> Vec<Target> {
        self.read().values().cloned().collect()
    }

    pub fn clear(&self) {
        self.write().clear();
    }
}
