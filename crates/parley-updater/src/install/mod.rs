//! Artifact download, verification and installation.
//!
//! The install strategy is picked once at startup:
//!
//! - [`InstallStrategy::Native`]: the build carries a signature the OS
//!   trusts (or the platform does not care). Verified artifacts become an
//!   [`ExitInstaller`] that installs when the app quits.
//! - [`InstallStrategy::ManualDiskImage`]: macOS builds without a trusted
//!   signature. Verified disk images are mounted and shown to the user.

pub mod commands;
pub mod disk_image;
pub mod native;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use url::Url;

pub use commands::{CommandOutput, HostCommands, SystemCommands};
pub use disk_image::DiskImageMounter;
pub use native::{ExitInstaller, InstallPlan};

use crate::cache::{ArtifactCache, CACHE_RETENTION};
use crate::error::UpdateError;
use crate::hash;
use crate::manifest::{PackageType, Platform, VerifiedRelease};
use crate::progress::{Progress, ProgressMeter};
use crate::source::EnvSource;
use crate::transport::ReleaseTransport;

/// Environment variable the AppImage runtime sets to the image path.
const ENV_APPIMAGE: &str = "APPIMAGE";

/// How verified updates reach the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStrategy {
    Native,
    ManualDiskImage,
}

impl InstallStrategy {
    /// Pick the strategy for this host.
    ///
    /// On macOS the running bundle's code signature decides: ad-hoc
    /// signatures and signatures without a Team ID fall back to disk images.
    pub fn detect(layout: &HostLayout, commands: &dyn SystemCommands) -> Self {
        if layout.platform != Platform::Darwin {
            return Self::Native;
        }
        let Some(bundle) = layout.app_bundle() else {
            tracing::info!("Not running from an app bundle, using manual disk image updates");
            return Self::ManualDiskImage;
        };

        if CodesignCheck::new(commands, &bundle).is_trusted() {
            Self::Native
        } else {
            tracing::info!(bundle = %bundle.display(), "App bundle lacks a trusted signature, using manual disk image updates");
            Self::ManualDiskImage
        }
    }

    /// Package type this strategy installs on `platform`.
    pub fn preferred_package(&self, platform: Platform) -> PackageType {
        match (self, platform) {
            (Self::ManualDiskImage, _) => PackageType::DiskImage,
            (Self::Native, Platform::Darwin) => PackageType::Zip,
            (Self::Native, Platform::Linux) => PackageType::AppImage,
            (Self::Native, Platform::Windows) => PackageType::InstallerExe,
        }
    }
}

/// Where the running app lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostLayout {
    pub platform: Platform,
    /// Path of the running executable
    pub executable: PathBuf,
    /// AppImage file the process was started from, if any
    pub appimage: Option<PathBuf>,
}

impl HostLayout {
    /// Inspect the running process.
    pub fn detect(env: &dyn EnvSource) -> Result<Self, UpdateError> {
        let platform = Platform::current()
            .ok_or_else(|| UpdateError::ConfigError("unsupported platform".to_string()))?;
        let executable = std::env::current_exe()?;
        let appimage = env.var(ENV_APPIMAGE).map(PathBuf::from);

        Ok(Self {
            platform,
            executable,
            appimage,
        })
    }

    /// Enclosing `.app` bundle of the executable.
    pub fn app_bundle(&self) -> Option<PathBuf> {
        self.executable
            .ancestors()
            .find(|p| p.extension().and_then(|e| e.to_str()) == Some("app"))
            .map(Path::to_path_buf)
    }
}

/// Checks whether an app bundle carries a signature Gatekeeper trusts.
pub struct CodesignCheck<'a> {
    commands: &'a dyn SystemCommands,
    bundle: &'a Path,
}

impl<'a> CodesignCheck<'a> {
    pub fn new(commands: &'a dyn SystemCommands, bundle: &'a Path) -> Self {
        Self { commands, bundle }
    }

    pub fn is_trusted(&self) -> bool {
        let verified = self
            .commands
            .run(
                "codesign",
                &[
                    OsStr::new("--verify"),
                    OsStr::new("--deep"),
                    OsStr::new("--strict"),
                    self.bundle.as_os_str(),
                ],
            )
            .is_ok_and(|o| o.success);
        if !verified {
            tracing::debug!(bundle = %self.bundle.display(), "codesign --verify failed");
            return false;
        }

        // codesign prints signing details on stderr
        match self.commands.run(
            "codesign",
            &[OsStr::new("-dv"), OsStr::new("--verbose=4"), self.bundle.as_os_str()],
        ) {
            Ok(output) => signature_is_trusted(&output.stderr),
            Err(e) => {
                tracing::warn!(error = %e, "Could not read code signature details");
                false
            }
        }
    }
}

/// Whether `codesign -dv` output describes a Team-ID-backed signature.
pub fn signature_is_trusted(details: &str) -> bool {
    let mut team_id = None;
    for line in details.lines() {
        let line = line.trim();
        if line.eq_ignore_ascii_case("Signature=adhoc") {
            return false;
        }
        if let Some(id) = line.strip_prefix("TeamIdentifier=") {
            team_id = Some(id.trim());
        }
    }
    matches!(team_id, Some(id) if !id.is_empty() && id != "not set")
}

/// Result of startup housekeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Cached files removed
    pub purged: usize,
    /// Stale mounts detached
    pub detached: usize,
}

/// Downloads, verifies and installs release artifacts.
#[derive(Debug)]
pub struct ArtifactInstaller {
    strategy: InstallStrategy,
    layout: HostLayout,
    cache: ArtifactCache,
    mounter: DiskImageMounter,
    commands: Arc<dyn SystemCommands>,
}

impl ArtifactInstaller {
    pub fn new(
        strategy: InstallStrategy,
        layout: HostLayout,
        cache: ArtifactCache,
        mounter: DiskImageMounter,
        commands: Arc<dyn SystemCommands>,
    ) -> Self {
        Self {
            strategy,
            layout,
            cache,
            mounter,
            commands,
        }
    }

    pub fn strategy(&self) -> InstallStrategy {
        self.strategy
    }

    pub fn platform(&self) -> Platform {
        self.layout.platform
    }

    /// Package type to select from manifests.
    pub fn package(&self) -> PackageType {
        self.strategy.preferred_package(self.layout.platform)
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    /// Stream `url` into the cache, reporting progress after every chunk.
    ///
    /// Nothing is left on disk if the transfer fails.
    pub async fn download<F>(
        &self,
        transport: &dyn ReleaseTransport,
        url: &Url,
        release: &VerifiedRelease,
        mut on_progress: F,
    ) -> Result<PathBuf, UpdateError>
    where
        F: FnMut(Progress) + Send,
    {
        tracing::info!(version = %release.version, url = %url, "Starting download");

        let download = transport.open(url).await?;
        let mut staged = self.cache.stage(&release.version)?;
        let mut meter = ProgressMeter::new(download.total);
        let mut stream = download.stream;

        on_progress(meter.snapshot());
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            staged.write_chunk(&chunk).await?;
            on_progress(meter.advance(chunk.len()));
        }

        if let Some(total) = download.total {
            if staged.written() != total {
                return Err(UpdateError::transport(
                    url.as_str(),
                    format!("transfer ended after {} of {total} bytes", staged.written()),
                ));
            }
        }

        let dest = self.cache.entry_path(&release.version, &release.artifact.url);
        let path = staged.commit(&dest).await?;
        tracing::info!(version = %release.version, path = %path.display(), "Download complete");
        Ok(path)
    }

    /// Check the downloaded file against the manifest hash.
    ///
    /// A mismatching file is deleted before the error is returned.
    pub fn verify(&self, path: &Path, release: &VerifiedRelease) -> Result<(), UpdateError> {
        match hash::verify_file(path, &release.artifact.sha256) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.discard(path);
                Err(e)
            }
        }
    }

    /// Verify a native artifact and prepare its exit-time install.
    pub fn stage(&self, path: &Path, release: &VerifiedRelease) -> Result<ExitInstaller, UpdateError> {
        self.verify(path, release)?;
        ExitInstaller::stage(
            release.version.clone(),
            path.to_path_buf(),
            release.artifact.package,
            &self.layout,
            self.cache.clone(),
            self.commands.clone(),
        )
        .inspect_err(|_| self.discard(path))
    }

    /// Mount a verified disk image and reveal it.
    pub fn mount(&self, path: &Path, release: &VerifiedRelease) -> Result<PathBuf, UpdateError> {
        self.mounter.mount(path, &release.version)
    }

    /// Purge old cache entries and detach mounts left by earlier runs.
    pub fn startup_cleanup(&self) -> CleanupReport {
        let purged = self
            .cache
            .purge_older_than(CACHE_RETENTION)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Artifact cache cleanup failed");
                0
            });
        let detached =
            if self.strategy == InstallStrategy::ManualDiskImage || self.layout.platform == Platform::Darwin {
                self.mounter.cleanup_stale_mounts()
            } else {
                0
            };

        let report = CleanupReport { purged, detached };
        tracing::debug!(?report, "Startup cleanup finished");
        report
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = self.cache.remove(path) {
            tracing::warn!(path = %path.display(), error = %e, "Failed to remove rejected artifact");
        }
    }
}
