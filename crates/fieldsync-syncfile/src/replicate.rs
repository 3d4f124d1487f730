//! Replication between local stores and a container.
//!
//! The container side runs the same replication procedures as a live peer,
//! connected through in-process channel pairs. It is treated as a desktop:
//! it receives every blob, and hands out media filtered for the local device.

use std::path::Path;

use tracing::{debug, info};

use fieldsync_core::DeviceType;
use fieldsync_store::{FsMediaStore, LogStore, MediaStore};
use fieldsync_sync::{
    memory, replicate_logs, replicate_media, LogStats, MediaStats, ProgressReporter, Result,
    SessionState, SessionTracker, SyncConfig, SyncError, SyncSummary,
};

use crate::format::{detect, ContainerVersion};
use crate::legacy::{LegacyContainer, SyncingMarker};
use crate::structured;
use crate::SyncfileConfig;

/// Log database inside a directory container.
pub const DIRECTORY_LOG: &str = "log.db";
/// Media directory inside a directory container.
pub const DIRECTORY_MEDIA: &str = "media";
/// Marker file written into a directory container.
pub const DO_NOT_EDIT: &str = "DO_NOT_EDIT.txt";

const DO_NOT_EDIT_TEXT: &str = "\
This directory is a fieldsync container.
Its files are written by fieldsync; editing them by hand can corrupt the data.
";

/// Replicate logs between `local` and `container`.
///
/// Progress is reported for the local side only.
pub async fn replicate_log_stores<L, C>(
    local: &L,
    container: &C,
    config: &SyncConfig,
    progress: &ProgressReporter,
) -> Result<LogStats>
where
    L: LogStore + ?Sized,
    C: LogStore + ?Sized,
{
    let (mut near, mut far) = memory::pair();
    let (scratch, _) = ProgressReporter::new(config.progress_interval);

    // Each side owns its end so that a failure hangs up on the other.
    let local_side = async move { replicate_logs(local, &mut near, config, progress).await };
    let container_side = async move { replicate_logs(container, &mut far, config, &scratch).await };

    let (local, container) = tokio::join!(local_side, container_side);
    let stats = local?;
    container?;
    Ok(stats)
}

/// Replicate media between `local` and `container`.
pub async fn replicate_media_stores<L, C>(
    local: &L,
    container: &C,
    local_type: DeviceType,
    config: &SyncConfig,
    progress: &ProgressReporter,
) -> Result<MediaStats>
where
    L: MediaStore + ?Sized,
    C: MediaStore + ?Sized,
{
    let (mut near, mut far) = memory::pair();
    let (scratch, _) = ProgressReporter::new(config.progress_interval);

    let local_side =
        async move { replicate_media(local, &mut near, DeviceType::Desktop, progress).await };
    let container_side =
        async move { replicate_media(container, &mut far, local_type, &scratch).await };

    let (local, container) = tokio::join!(local_side, container_side);
    let stats = local?;
    container?;
    Ok(stats)
}

/// Replicate with the syncfile at `path`, creating it if missing.
pub async fn sync_file<L, M>(
    logs: &L,
    media: &M,
    local_type: DeviceType,
    path: &Path,
    config: &SyncfileConfig,
    tracker: &SessionTracker,
) -> Result<SyncSummary>
where
    L: LogStore + ?Sized,
    M: MediaStore + ?Sized,
{
    let detected = detect(path).await?;
    let version = detected.unwrap_or(config.default_format);
    info!(path = %path.display(), ?version, fresh = detected.is_none(), "replicating with syncfile");

    let (logs, media) = match version {
        ContainerVersion::Legacy => {
            sync_legacy(logs, media, local_type, path, detected.is_some(), config, tracker).await?
        }
        ContainerVersion::Structured => {
            sync_structured(logs, media, local_type, path, config, tracker).await?
        }
    };

    Ok(SyncSummary {
        remote: None,
        logs,
        media,
        progress: tracker.progress().snapshot(),
    })
}

async fn sync_legacy<L, M>(
    logs: &L,
    media: &M,
    local_type: DeviceType,
    path: &Path,
    exists: bool,
    config: &SyncfileConfig,
    tracker: &SessionTracker,
) -> Result<(LogStats, MediaStats)>
where
    L: LogStore + ?Sized,
    M: MediaStore + ?Sized,
{
    let marker = SyncingMarker::acquire(path).await?;
    let result = async {
        let container = if exists {
            LegacyContainer::load(path).await?
        } else {
            LegacyContainer::new()
        };

        tracker.set_state(SessionState::SyncingDb);
        let log_stats =
            replicate_log_stores(logs, &container.logs, &config.sync, tracker.progress()).await?;

        tracker.set_state(SessionState::SyncingMedia);
        let media_stats = replicate_media_stores(
            media,
            &container.media,
            local_type,
            &config.sync,
            tracker.progress(),
        )
        .await?;

        container.save(path).await?;
        Ok::<_, SyncError>((log_stats, media_stats))
    }
    .await;
    marker.release().await?;
    result
}

async fn sync_structured<L, M>(
    logs: &L,
    media: &M,
    local_type: DeviceType,
    path: &Path,
    config: &SyncfileConfig,
    tracker: &SessionTracker,
) -> Result<(LogStats, MediaStats)>
where
    L: LogStore + ?Sized,
    M: MediaStore + ?Sized,
{
    let container = structured::open(path).await?;
    tracker.set_state(SessionState::SyncingDb);

    let log_side = async {
        let stats =
            replicate_log_stores(logs, &container, &config.sync, tracker.progress()).await?;
        tracker.set_state(SessionState::SyncingMedia);
        Ok::<_, SyncError>(stats)
    };
    let media_side = replicate_media_stores(
        media,
        &container,
        local_type,
        &config.sync,
        tracker.progress(),
    );

    let (log_stats, media_stats) = tokio::join!(log_side, media_side);
    let log_stats = log_stats?;
    let media_stats = media_stats?;

    structured::stamp(&container).await?;
    debug!(path = %path.display(), "structured container updated");
    Ok((log_stats, media_stats))
}

/// Replicate with a directory container: `log.db`, `media/` and a
/// `DO_NOT_EDIT.txt` notice.
pub async fn sync_directory<L, M>(
    logs: &L,
    media: &M,
    local_type: DeviceType,
    dir: &Path,
    config: &SyncfileConfig,
    tracker: &SessionTracker,
) -> Result<SyncSummary>
where
    L: LogStore + ?Sized,
    M: MediaStore + ?Sized,
{
    info!(dir = %dir.display(), "replicating with directory");
    tokio::fs::create_dir_all(dir).await?;
    let container_logs = structured::open_sqlite(dir.join(DIRECTORY_LOG)).await?;
    let container_media = FsMediaStore::open(dir.join(DIRECTORY_MEDIA)).await?;

    tracker.set_state(SessionState::SyncingDb);
    let log_stats =
        replicate_log_stores(logs, &container_logs, &config.sync, tracker.progress()).await?;

    tracker.set_state(SessionState::SyncingMedia);
    let media_stats = replicate_media_stores(
        media,
        &container_media,
        local_type,
        &config.sync,
        tracker.progress(),
    )
    .await?;

    tokio::fs::write(dir.join(DO_NOT_EDIT), DO_NOT_EDIT_TEXT).await?;

    Ok(SyncSummary {
        remote: None,
        logs: log_stats,
        media: media_stats,
        progress: tracker.progress().snapshot(),
    })
}
