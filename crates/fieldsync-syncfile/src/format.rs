//! Container versions, format names and detection.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::debug;

use fieldsync_sync::{Result, SyncError};

/// Metadata key naming the log format inside a container.
pub const META_FORMAT_KEY: &str = "p2p-db";

/// Metadata key holding the container version.
pub const META_VERSION_KEY: &str = "version";

/// Leading bytes of a gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Container layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerVersion {
    /// Gzipped tar of a metadata record, a CBOR log snapshot and media files.
    Legacy = 1,
    /// A single SQLite database holding logs, media and metadata.
    Structured = 2,
}

impl ContainerVersion {
    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::Legacy),
            2 => Ok(Self::Structured),
            other => Err(SyncError::UnsupportedSyncfile(format!(
                "unknown container version {other}"
            ))),
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Log format stored in this container version.
    pub fn format(self) -> FormatName {
        match self {
            Self::Legacy => FormatName::EntriesCbor,
            Self::Structured => FormatName::Sqlite,
        }
    }
}

/// Log format inside a container, as named in its metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatName {
    EntriesCbor = 1,
    Sqlite = 2,
}

impl FormatName {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "entries-cbor" => Ok(Self::EntriesCbor),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(SyncError::UnsupportedSyncfile(format!(
                "unknown log format {other:?}"
            ))),
        }
    }

    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::EntriesCbor),
            2 => Ok(Self::Sqlite),
            other => Err(SyncError::UnsupportedSyncfile(format!(
                "unknown log format {other}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::EntriesCbor => "entries-cbor",
            Self::Sqlite => "sqlite",
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Probe the container at `path`.
///
/// Returns `None` if there is nothing there yet (missing or empty file), in
/// which case a fresh container in the default format is written.
pub async fn detect(path: &Path) -> Result<Option<ContainerVersion>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no container yet");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let mut magic = [0u8; 2];
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..]).await?;
        if n == 0 {
            break;
        }
        read += n;
    }

    let version = match read {
        0 => None,
        2 if magic == GZIP_MAGIC => Some(ContainerVersion::Legacy),
        _ => Some(ContainerVersion::Structured),
    };
    debug!(path = %path.display(), ?version, "detected container");
    Ok(version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_numbers() {
        assert_eq!(FormatName::parse("entries-cbor").unwrap().as_u32(), 1);
        assert_eq!(FormatName::parse("sqlite").unwrap().as_u32(), 2);
        assert_eq!(ContainerVersion::Legacy.as_u32(), 1);
        assert_eq!(ContainerVersion::Structured.as_u32(), 2);
        assert_eq!(ContainerVersion::Structured.format(), FormatName::Sqlite);
    }

    #[test]
    fn test_unknown_format_unsupported() {
        assert!(matches!(
            FormatName::parse("leveldb"),
            Err(SyncError::UnsupportedSyncfile(_))
        ));
        assert!(matches!(
            FormatName::from_u32(7),
            Err(SyncError::UnsupportedSyncfile(_))
        ));
        assert!(matches!(
            ContainerVersion::from_u32(3),
            Err(SyncError::UnsupportedSyncfile(_))
        ));
    }

    #[tokio::test]
    async fn test_detect_missing_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.sync");
        assert_eq!(detect(&path).await.unwrap(), None);

        std::fs::write(&path, b"").unwrap();
        assert_eq!(detect(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_detect_by_magic() {
        let dir = tempfile::tempdir().unwrap();

        let legacy = dir.path().join("a.sync");
        std::fs::write(&legacy, [0x1f, 0x8b, 0x08, 0x00]).unwrap();
        assert_eq!(detect(&legacy).await.unwrap(), Some(ContainerVersion::Legacy));

        // The extension says nothing.
        let structured = dir.path().join("b.tar.gz");
        std::fs::write(&structured, b"SQLite format 3\0").unwrap();
        assert_eq!(
            detect(&structured).await.unwrap(),
            Some(ContainerVersion::Structured)
        );
    }
}
