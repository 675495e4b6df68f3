//! Manual disk-image installation.
//!
//! Used when the running app bundle has no signature the OS update
//! machinery trusts (ad-hoc or missing Team ID). The verified image is
//! attached read-only under an application-owned mount root and revealed in
//! Finder; the user finishes the install by dragging the app.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;

use super::commands::SystemCommands;
use crate::error::UpdateError;

/// Name prefix of every mount point this app creates.
pub const MOUNT_PREFIX: &str = "parley-update-";

const MOUNT_ROOT_NAME: &str = "parley-update-mounts";
const HDIUTIL: &str = "hdiutil";
const OPEN: &str = "open";

/// Attaches and detaches update disk images.
#[derive(Debug, Clone)]
pub struct DiskImageMounter {
    root: PathBuf,
    commands: Arc<dyn SystemCommands>,
}

impl DiskImageMounter {
    pub fn new(root: impl Into<PathBuf>, commands: Arc<dyn SystemCommands>) -> Self {
        Self {
            root: root.into(),
            commands,
        }
    }

    /// Mount root under the system temp directory.
    pub fn default_root() -> PathBuf {
        std::env::temp_dir().join(MOUNT_ROOT_NAME)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mount_point(&self, version: &Version) -> PathBuf {
        self.root.join(format!("{MOUNT_PREFIX}{version}"))
    }

    /// Attach `image` read-only and open it in the file browser.
    ///
    /// The caller must have verified the image hash already.
    pub fn mount(&self, image: &Path, version: &Version) -> Result<PathBuf, UpdateError> {
        if !self.commands.is_available(HDIUTIL) {
            return Err(UpdateError::InstallerPrecondition(format!(
                "{HDIUTIL} is not available"
            )));
        }

        let mount_point = self.mount_point(version);
        if mount_point.exists() {
            // Leftover from an earlier attempt for the same version
            self.detach(&mount_point);
            let _ = std::fs::remove_dir(&mount_point);
        }
        std::fs::create_dir_all(&mount_point)?;

        let output = self.commands.run(
            HDIUTIL,
            &[
                OsStr::new("attach"),
                OsStr::new("-readonly"),
                OsStr::new("-noautoopen"),
                OsStr::new("-mountpoint"),
                mount_point.as_os_str(),
                image.as_os_str(),
            ],
        );
        if let Err(e) = output.and_then(|o| o.check(HDIUTIL)) {
            let _ = std::fs::remove_dir(&mount_point);
            return Err(e);
        }
        tracing::info!(image = %image.display(), mount_point = %mount_point.display(), "Disk image mounted");

        match self.commands.run(OPEN, &[mount_point.as_os_str()]) {
            Ok(output) if output.success => {}
            Ok(output) => {
                tracing::warn!(stderr = %output.stderr.trim(), "Failed to reveal mounted update")
            }
            Err(e) => tracing::warn!(error = %e, "Failed to reveal mounted update"),
        }

        Ok(mount_point)
    }

    /// Detach every mount point left under the mount root.
    ///
    /// Only entries named with [`MOUNT_PREFIX`] are touched. Failures are
    /// logged and skipped; running it twice is harmless. Returns the number
    /// of entries detached.
    pub fn cleanup_stale_mounts(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };

        let mut detached = 0;
        for entry in entries.flatten() {
            let owned = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(MOUNT_PREFIX));
            let path = entry.path();
            if !owned || !path.is_dir() {
                continue;
            }

            if self.detach(&path) {
                detached += 1;
            }
            if let Err(e) = std::fs::remove_dir(&path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove stale mount point");
            }
        }
        detached
    }

    fn detach(&self, mount_point: &Path) -> bool {
        let result = self.commands.run(
            HDIUTIL,
            &[OsStr::new("detach"), OsStr::new("-force"), mount_point.as_os_str()],
        );
        match result {
            Ok(output) if output.success => {
                tracing::info!(mount_point = %mount_point.display(), "Detached stale update mount");
                true
            }
            Ok(output) => {
                tracing::warn!(
                    mount_point = %mount_point.display(),
                    stderr = %output.stderr.trim(),
                    "Failed to detach update mount"
                );
                false
            }
            Err(e) => {
                tracing::warn!(mount_point = %mount_point.display(), error = %e, "Failed to detach update mount");
                false
            }
        }
    }
}
