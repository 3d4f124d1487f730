//! # fieldsync syncfile
//!
//! Replication through a file or directory carried between devices.
//!
//! A syncfile is either a legacy gzipped tar or a structured SQLite
//! database. The kind is detected from the first bytes of the file, never
//! from its name; a missing or empty file is written fresh in the configured
//! default format.
//!
//! Replication against a container uses the same log and media procedures
//! as a live session, so a round trip A → syncfile → B carries the same data
//! a direct sync would.

pub mod format;
pub mod legacy;
pub mod replicate;
pub mod structured;

use std::path::PathBuf;
use std::sync::Arc;

use fieldsync_core::DeviceType;
use fieldsync_store::{LogStore, MediaStore};
use fieldsync_sync::{SyncConfig, SyncHandle};

pub use format::{detect, ContainerVersion, FormatName, META_FORMAT_KEY};
pub use replicate::{sync_directory, sync_file};

/// Configuration for syncfile replication.
#[derive(Debug, Clone)]
pub struct SyncfileConfig {
    /// Format of newly created containers.
    pub default_format: ContainerVersion,
    pub sync: SyncConfig,
}

impl Default for SyncfileConfig {
    fn default() -> Self {
        Self {
            default_format: ContainerVersion::Structured,
            sync: SyncConfig::default(),
        }
    }
}

/// Replicate with the syncfile at `path` on a new task.
pub fn replicate_file<L, M>(
    logs: Arc<L>,
    media: Arc<M>,
    local_type: DeviceType,
    path: impl Into<PathBuf>,
    config: SyncfileConfig,
) -> SyncHandle
where
    L: LogStore + ?Sized + 'static,
    M: MediaStore + ?Sized + 'static,
{
    let path = path.into();
    SyncHandle::spawn(&config.sync.clone(), move |tracker| async move {
        sync_file(&*logs, &*media, local_type, &path, &config, &tracker).await
    })
}

/// Replicate with the directory container at `dir` on a new task.
pub fn replicate_directory<L, M>(
    logs: Arc<L>,
    media: Arc<M>,
    local_type: DeviceType,
    dir: impl Into<PathBuf>,
    config: SyncfileConfig,
) -> SyncHandle
where
    L: LogStore + ?Sized + 'static,
    M: MediaStore + ?Sized + 'static,
{
    let dir = dir.into();
    SyncHandle::spawn(&config.sync.clone(), move |tracker| async move {
        sync_directory(&*logs, &*media, local_type, &dir, &config, &tracker).await
    })
}
