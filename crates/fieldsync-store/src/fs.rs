//! Media stored as plain files under a root directory.
//!
//! Blob `preview/a.jpg` lives at `<root>/preview/a.jpg`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use crate::error::Result;
use crate::traits::{validate_media_name, MediaStore};

/// Filesystem media store.
#[derive(Debug, Clone)]
pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    /// Open (and create if needed) a media directory.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<PathBuf> {
        validate_media_name(name)?;
        Ok(name.split('/').fold(self.root.clone(), |p, part| p.join(part)))
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
        } else if file_type.is_file() {
            let name = path
                .strip_prefix(root)
                .ok()
                .and_then(|rel| {
                    rel.components()
                        .map(|c| c.as_os_str().to_str())
                        .collect::<Option<Vec<_>>>()
                })
                .map(|parts| parts.join("/"));
            // Skip partially written blobs and names we could not represent.
            if let Some(name) = name.filter(|n| !n.ends_with(".partial")) {
                out.push(name);
            }
        }
    }
    Ok(())
}

#[async_trait]
impl MediaStore for FsMediaStore {
    async fn list(&self) -> Result<Vec<String>> {
        let root = self.root.clone();
        let names = tokio::task::spawn_blocking(move || {
            let mut names = Vec::new();
            walk(&root, &root, &mut names)?;
            names.sort();
            Ok::<_, std::io::Error>(names)
        })
        .await??;
        Ok(names)
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path_of(name)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, name: &str) -> Result<Option<Bytes>> {
        let path = self.path_of(name)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<()> {
        let path = self.path_of(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut partial = path.clone().into_os_string();
        partial.push(".partial");
        let partial = PathBuf::from(partial);
        tokio::fs::write(&partial, &data).await?;
        tokio::fs::rename(&partial, &path).await?;
        trace!(name, bytes = data.len(), "stored media blob");
        Ok(())
    }
}
