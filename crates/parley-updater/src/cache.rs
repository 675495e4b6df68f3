//! On-disk cache of downloaded artifacts.
//!
//! Layout: `<root>/<version>/<file name>`. Transfers are written to a
//! `.partial-*` temporary file next to their final location and renamed into
//! place only once complete, so a path returned by [`StagedFile::commit`]
//! always holds a whole transfer. A staged file that is dropped without being
//! committed deletes itself.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use semver::Version;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;

use crate::error::UpdateError;

/// How long a cached artifact is kept before startup cleanup removes it.
pub const CACHE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Prefix of in-progress transfer files.
const PARTIAL_PREFIX: &str = ".partial-";

/// Version-keyed artifact cache.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    root: PathBuf,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of `file_name` for `version`.
    pub fn entry_path(&self, version: &Version, file_name: &str) -> PathBuf {
        self.root.join(version.to_string()).join(file_name)
    }

    /// Start a new transfer for `version`.
    pub fn stage(&self, version: &Version) -> Result<StagedFile, UpdateError> {
        let dir = self.root.join(version.to_string());
        std::fs::create_dir_all(&dir)?;

        let temp = tempfile::Builder::new()
            .prefix(PARTIAL_PREFIX)
            .tempfile_in(&dir)?;
        let (file, path) = temp.into_parts();
        tracing::debug!(path = %path.display(), "Staging download");

        Ok(StagedFile {
            file: tokio::fs::File::from_std(file),
            path,
            written: 0,
        })
    }

    /// Delete a cached artifact and its version directory if it is now empty.
    pub fn remove(&self, path: &Path) -> Result<(), UpdateError> {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed cached artifact"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(dir) = path.parent() {
            if dir.starts_with(&self.root) && dir != self.root {
                // Fails harmlessly if other files remain
                let _ = std::fs::remove_dir(dir);
            }
        }
        Ok(())
    }

    /// Remove artifacts and partial transfers not modified for `max_age`.
    ///
    /// A partial file is only stale once its writer has stopped touching it;
    /// one still being written by another process is left alone.
    ///
    /// Best-effort: entries that cannot be removed are logged and skipped.
    /// Returns the number of files removed.
    pub fn purge_older_than(&self, max_age: Duration) -> Result<usize, UpdateError> {
        let versions = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;

        for version_dir in versions.flatten() {
            let dir = version_dir.path();
            if !dir.is_dir() {
                continue;
            }
            let Ok(entries) = std::fs::read_dir(&dir) else {
                continue;
            };

            for entry in entries.flatten() {
                let path = entry.path();
                if !is_expired(&path, now, max_age) {
                    continue;
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        tracing::info!(path = %path.display(), "Purged cached artifact");
                        removed += 1;
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "Failed to purge cached artifact");
                    }
                }
            }

            let _ = std::fs::remove_dir(&dir);
        }

        Ok(removed)
    }
}

fn is_expired(path: &Path, now: SystemTime, max_age: Duration) -> bool {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| now.duration_since(modified).ok())
        .is_some_and(|age| age > max_age)
}

/// An in-progress transfer.
#[derive(Debug)]
pub struct StagedFile {
    file: tokio::fs::File,
    path: TempPath,
    written: u64,
}

impl StagedFile {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), UpdateError> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flush to disk and move the file to `dest`.
    pub async fn commit(mut self, dest: &Path) -> Result<PathBuf, UpdateError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        self.path
            .persist(dest)
            .map_err(|e| UpdateError::IoError(e.error))?;
        tracing::debug!(path = %dest.display(), bytes = self.written, "Download committed");
        Ok(dest.to_path_buf())
    }
}
