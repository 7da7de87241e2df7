//! File storage for derivative renditions and watermark assets

use crate::error::{Result, WatermarkError};
use async_trait::async_trait;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Byte-level access to stored renditions and watermark images
#[async_trait]
pub trait MediaStorage: Send + Sync {
    /// Read one derivative rendition of a media
    async fn read_derivative(&self, derivative: &str, storage_id: &str) -> Result<Vec<u8>>;

    /// Replace a derivative rendition. Readers see either the old or the new
    /// bytes, never a partial write.
    async fn replace_derivative(&self, derivative: &str, storage_id: &str, bytes: Vec<u8>)
        -> Result<()>;

    /// Read a watermark overlay image by its storage-relative reference
    async fn read_asset(&self, image_ref: &str) -> Result<Vec<u8>>;
}

/// Local filesystem storage laid out as `<root>/<derivative>/<storage id>`
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of a derivative rendition
    pub fn derivative_path(&self, derivative: &str, storage_id: &str) -> Result<PathBuf> {
        let derivative = relative_path(derivative)?;
        let storage_id = relative_path(storage_id)?;
        Ok(self.root.join(derivative).join(storage_id))
    }

    /// Path of a watermark asset
    pub fn asset_path(&self, image_ref: &str) -> Result<PathBuf> {
        Ok(self.root.join(relative_path(image_ref)?))
    }
}

#[async_trait]
impl MediaStorage for FileStore {
    async fn read_derivative(&self, derivative: &str, storage_id: &str) -> Result<Vec<u8>> {
        let path = self.derivative_path(derivative, storage_id)?;
        read_file(path).await
    }

    async fn replace_derivative(
        &self,
        derivative: &str,
        storage_id: &str,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let path = self.derivative_path(derivative, storage_id)?;
        tokio::task::spawn_blocking(move || atomic_write(&path, &bytes))
            .await
            .map_err(|e| WatermarkError::Io(std::io::Error::other(e)))?
    }

    async fn read_asset(&self, image_ref: &str) -> Result<Vec<u8>> {
        let path = self.asset_path(image_ref)?;
        read_file(path).await
    }
}

async fn read_file(path: PathBuf) -> Result<Vec<u8>> {
    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(WatermarkError::Storage { path })
        }
        Err(e) => Err(WatermarkError::Io(e)),
    }
}

/// Write to a temporary file next to the target, then rename it over the
/// target. The original stays untouched if anything fails before the rename.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| WatermarkError::Storage {
            path: path.to_path_buf(),
        })?;
    if !parent.is_dir() {
        return Err(WatermarkError::Storage {
            path: parent.to_path_buf(),
        });
    }

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    // The temp file is created 0600; keep whatever mode the target had
    match std::fs::metadata(path) {
        Ok(existing) => temp.as_file().set_permissions(existing.permissions())?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(WatermarkError::Io(e)),
    }
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| WatermarkError::Io(e.error))?;

    debug!("Replaced {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

/// Accept only plain relative paths that stay below the storage root
fn relative_path(value: &str) -> Result<&Path> {
    let path = Path::new(value.trim());
    let valid = !value.trim().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));

    if valid {
        Ok(path)
    } else {
        Err(WatermarkError::invalid_argument(format!(
            "storage path '{}' must be relative and must not contain '..'",
            value
        )))
    }
}
