//! Legacy containers: a gzipped tar archive.
//!
//! ```text
//! meta.json        {"p2p-db":"entries-cbor","version":1}
//! log.cbor         CBOR array of entries
//! media/<name>     one file per blob
//! ```
//!
//! The archive is unpacked into in-memory stores, replicated against, and
//! written back whole.

use std::io::Read;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use fieldsync_core::Entry;
use fieldsync_store::{validate_media_name, LogStore, MediaStore, MemoryLogStore, MemoryMediaStore};
use fieldsync_sync::{Result, SyncError};

use crate::format::{ContainerVersion, FormatName};

const META_PATH: &str = "meta.json";
const LOG_PATH: &str = "log.cbor";
const MEDIA_DIR: &str = "media/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Meta {
    #[serde(rename = "p2p-db")]
    format: String,
    version: u32,
}

impl Meta {
    fn current() -> Self {
        Self {
            format: FormatName::EntriesCbor.as_str().to_string(),
            version: ContainerVersion::Legacy.as_u32(),
        }
    }

    fn check(&self) -> Result<()> {
        if ContainerVersion::from_u32(self.version)? != ContainerVersion::Legacy {
            return Err(SyncError::UnsupportedSyncfile(format!(
                "version {} in a gzip container",
                self.version
            )));
        }
        match FormatName::parse(&self.format)? {
            FormatName::EntriesCbor => Ok(()),
            other => Err(SyncError::UnsupportedSyncfile(format!(
                "log format {} in a gzip container",
                other.as_str()
            ))),
        }
    }
}

/// Contents of a legacy archive.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub entries: Vec<Entry>,
    pub media: Vec<(String, Bytes)>,
}

/// Build a gzipped tar archive from a snapshot.
pub fn pack(snapshot: &Snapshot) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let encoder = GzEncoder::new(&mut buffer, Compression::default());
    let mut tar = tar::Builder::new(encoder);

    let meta = serde_json::to_vec(&Meta::current()).map_err(|e| SyncError::Codec(e.to_string()))?;
    append(&mut tar, META_PATH, &meta)?;

    let mut log = Vec::new();
    ciborium::into_writer(&snapshot.entries, &mut log).map_err(|e| SyncError::Codec(e.to_string()))?;
    append(&mut tar, LOG_PATH, &log)?;

    for (name, data) in &snapshot.media {
        append(&mut tar, &format!("{MEDIA_DIR}{name}"), data)?;
    }

    tar.into_inner()?.finish()?;
    Ok(buffer)
}

fn append<W: std::io::Write>(tar: &mut tar::Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    tar.append_data(&mut header, path, data)?;
    Ok(())
}

/// Read a gzipped tar archive.
pub fn unpack(bytes: &[u8]) -> Result<Snapshot> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut snapshot = Snapshot::default();
    let mut meta = None;

    for file in archive.entries()? {
        let mut file = file?;
        if file.header().entry_type().is_dir() {
            continue;
        }
        let path = file.path()?.to_string_lossy().into_owned();
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        if path == META_PATH {
            let m: Meta = serde_json::from_slice(&data)
                .map_err(|e| SyncError::UnsupportedSyncfile(format!("bad metadata: {e}")))?;
            m.check()?;
            meta = Some(m);
        } else if path == LOG_PATH {
            snapshot.entries = ciborium::from_reader(data.as_slice())
                .map_err(|e| SyncError::Codec(format!("log snapshot: {e}")))?;
        } else if let Some(name) = path.strip_prefix(MEDIA_DIR) {
            validate_media_name(name)?;
            snapshot.media.push((name.to_string(), Bytes::from(data)));
        } else {
            debug!(%path, "ignoring unknown archive member");
        }
    }

    if meta.is_none() {
        return Err(SyncError::UnsupportedSyncfile("missing meta.json".into()));
    }
    Ok(snapshot)
}

/// An unpacked legacy container.
#[derive(Default)]
pub struct LegacyContainer {
    pub logs: MemoryLogStore,
    pub media: MemoryMediaStore,
}

impl LegacyContainer {
    /// An empty container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Unpack the archive at `path`.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await?;
        let snapshot = tokio::task::spawn_blocking(move || unpack(&bytes))
            .await
            .map_err(|e| SyncError::Sync(format!("unpack task failed: {e}")))??;

        let container = Self::new();
        for entry in &snapshot.entries {
            container.logs.insert_entry(entry).await?;
        }
        for (name, data) in snapshot.media {
            container.media.write(&name, data).await?;
        }
        debug!(
            path = %path.display(),
            entries = snapshot.entries.len(),
            "loaded legacy container"
        );
        Ok(container)
    }

    /// Write the container to `path` atomically.
    pub async fn save(&self, path: &Path) -> Result<()> {
        let mut snapshot = Snapshot {
            entries: self.logs.all_entries()?,
            media: Vec::new(),
        };
        for name in self.media.list().await? {
            if let Some(data) = self.media.read(&name).await? {
                snapshot.media.push((name, data));
            }
        }

        let bytes = tokio::task::spawn_blocking(move || pack(&snapshot))
            .await
            .map_err(|e| SyncError::Sync(format!("pack task failed: {e}")))??;

        let partial = sibling(path, "partial");
        tokio::fs::write(&partial, &bytes).await?;
        tokio::fs::rename(&partial, path).await?;
        debug!(path = %path.display(), bytes = bytes.len(), "wrote legacy container");
        Ok(())
    }
}

/// `<path>.<suffix>`
pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// Exclusive claim on a container, held as a `<path>.syncing` file.
///
/// Give it up with [`SyncingMarker::release`]. A marker dropped without
/// being released (a cancelled or panicking sync) is removed in the
/// background.
#[derive(Debug)]
pub struct SyncingMarker {
    path: PathBuf,
    released: bool,
}

impl SyncingMarker {
    /// Create the marker. Fails with "container busy" if it already exists.
    pub async fn acquire(container: &Path) -> Result<Self> {
        let path = sibling(container, "syncing");
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(Self {
                path,
                released: false,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(SyncError::Sync("container busy".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the marker file.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SyncingMarker {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let path = std::mem::take(&mut self.path);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!(path = %path.display(), error = %e, "could not remove syncing marker");
                    }
                });
            }
            // Outside a runtime nothing async is left to block.
            Err(_) => {
                let _ = std::fs::remove_file(&path);
            }
        }
    }
}
