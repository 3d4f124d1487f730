//! Structured containers: one SQLite file.

use std::path::{Path, PathBuf};

use tracing::debug;

use fieldsync_store::SqliteStore;
use fieldsync_sync::{Result, SyncError};

use crate::format::{ContainerVersion, FormatName, META_FORMAT_KEY, META_VERSION_KEY};

/// Open (or create) a SQLite-backed store in a blocking task.
pub(crate) async fn open_sqlite(path: PathBuf) -> Result<SqliteStore> {
    tokio::task::spawn_blocking(move || SqliteStore::open(&path))
        .await
        .map_err(|e| SyncError::Sync(format!("open task failed: {e}")))?
        .map_err(SyncError::from)
}

/// Open the structured container at `path`, creating it if needed.
///
/// Anything that is not a SQLite database of a known format is
/// `UnsupportedSyncfile`.
pub async fn open(path: &Path) -> Result<SqliteStore> {
    let store = open_sqlite(path.to_path_buf())
        .await
        .map_err(|e| SyncError::UnsupportedSyncfile(format!("{}: {e}", path.display())))?;

    if let Some(format) = store.get_meta(META_FORMAT_KEY).await? {
        if FormatName::parse(&format)? != FormatName::Sqlite {
            return Err(SyncError::UnsupportedSyncfile(format!(
                "log format {format} in a sqlite container"
            )));
        }
    }
    if let Some(version) = store.get_meta(META_VERSION_KEY).await? {
        let version: u32 = version
            .parse()
            .map_err(|_| SyncError::UnsupportedSyncfile(format!("bad version {version:?}")))?;
        if ContainerVersion::from_u32(version)? != ContainerVersion::Structured {
            return Err(SyncError::UnsupportedSyncfile(format!(
                "version {version} in a sqlite container"
            )));
        }
    }
    Ok(store)
}

/// Record the container's format and version.
pub async fn stamp(store: &SqliteStore) -> Result<()> {
    store
        .set_meta(META_FORMAT_KEY, FormatName::Sqlite.as_str())
        .await?;
    store
        .set_meta(
            META_VERSION_KEY,
            &ContainerVersion::Structured.as_u32().to_string(),
        )
        .await?;
    debug!(path = ?store.path(), "stamped container metadata");
    Ok(())
}
