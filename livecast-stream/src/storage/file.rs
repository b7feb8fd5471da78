// File system storage backend
//
// Flat layout: every key is a file directly under `base_path`. Only keys
// shaped like segment file names are accepted, so a request can never name a
// path outside the output root.

use super::{is_segment_file_name, SegmentStorage};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{Error, ErrorKind, Result};
use std::path::PathBuf;
use tokio::fs;

pub struct FileStorage {
    base_path: PathBuf,
}

impl FileStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Create the output root if it does not exist yet
    pub async fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.base_path).await
    }

    /// Delete every segment file left in the output root
    ///
    /// Other files are never touched. Returns the number of files removed.
    pub async fn remove_segments(&self) -> Result<usize> {
        if !fs::try_exists(&self.base_path).await.unwrap_or(false) {
            tracing::debug!("Output root does not exist: {:?}", self.base_path);
            return Ok(0);
        }

        let mut deleted = 0;
        let mut entries = fs::read_dir(&self.base_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            let Ok(file_type) = entry.file_type().await else {
                continue;
            };
            if !file_type.is_file() || !is_segment_file_name(&entry.file_name().to_string_lossy()) {
                continue;
            }

            let path = entry.path();
            if fs::remove_file(&path).await.is_ok() {
                deleted += 1;
                tracing::trace!("Deleted stale segment: {:?}", path);
            }
        }

        tracing::debug!(
            "Removed {} segment files from {:?}",
            deleted,
            self.base_path
        );
        Ok(deleted)
    }

    fn get_path(&self, key: &str) -> Result<PathBuf> {
        if !is_segment_file_name(key) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("invalid segment key: {key}"),
            ));
        }
        Ok(self.base_path.join(key))
    }
}

#[async_trait]
impl SegmentStorage for FileStorage {
    async fn read(&self, key: &str) -> Result<Bytes> {
        let file_path = self.get_path(key)?;
        let data = fs::read(&file_path).await?;

        tracing::trace!("Read: {:?} ({} bytes)", file_path, data.len());

        Ok(Bytes::from(data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let file_path = self.get_path(key)?;

        match fs::remove_file(&file_path).await {
            Ok(()) => {
                tracing::trace!("Deleted: {:?}", file_path);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}
