//! Exit-time installation for trusted builds.
//!
//! A verified artifact is turned into an [`ExitInstaller`] while the app is
//! still running; all preconditions are checked at that point. The install
//! itself happens in [`ExitInstaller::run`], which consumes the installer
//! and is meant to be called once, after the event loop has stopped.

use std::ffi::OsStr;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use semver::Version;

use super::commands::SystemCommands;
use super::HostLayout;
use crate::cache::ArtifactCache;
use crate::error::UpdateError;
use crate::manifest::PackageType;

const STAGING_PREFIX: &str = ".parley-update-";
const DITTO: &str = "ditto";

/// What the exit-time install does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallPlan {
    /// Replace the running AppImage file
    ReplaceAppImage { target: PathBuf },
    /// Launch the Windows installer silently
    RunInstaller,
    /// Extract the zip and swap the `.app` bundle
    SwapBundle { bundle: PathBuf },
}

/// A verified update waiting for the process to exit.
#[must_use = "an exit installer does nothing unless run"]
#[derive(Debug)]
pub struct ExitInstaller {
    version: Version,
    artifact: PathBuf,
    plan: InstallPlan,
    cache: ArtifactCache,
    commands: Arc<dyn SystemCommands>,
}

impl ExitInstaller {
    /// Check preconditions for installing `artifact` and prepare the plan.
    pub(crate) fn stage(
        version: Version,
        artifact: PathBuf,
        package: PackageType,
        layout: &HostLayout,
        cache: ArtifactCache,
        commands: Arc<dyn SystemCommands>,
    ) -> Result<Self, UpdateError> {
        if !artifact.is_file() {
            return Err(UpdateError::InstallerPrecondition(format!(
                "artifact {} is missing",
                artifact.display()
            )));
        }

        let plan = match package {
            PackageType::AppImage => {
                let target = layout.appimage.clone().ok_or_else(|| {
                    UpdateError::InstallerPrecondition("not running from an AppImage".to_string())
                })?;
                if !target.is_file() {
                    return Err(UpdateError::InstallerPrecondition(format!(
                        "AppImage {} does not exist",
                        target.display()
                    )));
                }
                ensure_writable(parent_of(&target)?)?;
                InstallPlan::ReplaceAppImage { target }
            }
            PackageType::InstallerExe => InstallPlan::RunInstaller,
            PackageType::Zip => {
                let bundle = layout.app_bundle().ok_or_else(|| {
                    UpdateError::InstallerPrecondition("not running from an app bundle".to_string())
                })?;
                if !commands.is_available(DITTO) {
                    return Err(UpdateError::InstallerPrecondition(format!("{DITTO} is not available")));
                }
                ensure_writable(parent_of(&bundle)?)?;
                InstallPlan::SwapBundle { bundle }
            }
            PackageType::DiskImage => {
                return Err(UpdateError::InstallerPrecondition(
                    "disk images cannot be installed automatically".to_string(),
                ));
            }
        };

        tracing::info!(version = %version, artifact = %artifact.display(), ?plan, "Update staged for exit");
        Ok(Self {
            version,
            artifact,
            plan,
            cache,
            commands,
        })
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn plan(&self) -> &InstallPlan {
        &self.plan
    }

    /// Install the staged update. Call after the event loop has stopped.
    ///
    /// With `relaunch`, the updated app is started again afterwards.
    pub fn run(self, relaunch: bool) -> Result<(), UpdateError> {
        tracing::info!(version = %self.version, relaunch, "Installing update");

        match &self.plan {
            InstallPlan::ReplaceAppImage { target } => {
                replace_file(&self.artifact, target)?;
                self.discard_artifact();
                if relaunch {
                    self.commands.spawn_detached(target.as_os_str(), &[])?;
                }
            }
            InstallPlan::RunInstaller => {
                // The installer deletes nothing of ours; the cache purge does
                let mut args = vec![OsStr::new("/S")];
                if relaunch {
                    args.push(OsStr::new("--force-run"));
                }
                self.commands.spawn_detached(self.artifact.as_os_str(), &args)?;
            }
            InstallPlan::SwapBundle { bundle } => {
                swap_bundle(self.commands.as_ref(), &self.artifact, bundle)?;
                self.discard_artifact();
                if relaunch {
                    self.commands
                        .spawn_detached(OsStr::new("open"), &[OsStr::new("-n"), bundle.as_os_str()])?;
                }
            }
        }

        tracing::info!(version = %self.version, "Update installed");
        Ok(())
    }

    fn discard_artifact(&self) {
        if let Err(e) = self.cache.remove(&self.artifact) {
            tracing::warn!(path = %self.artifact.display(), error = %e, "Failed to remove installed artifact");
        }
    }
}

fn parent_of(path: &Path) -> Result<&Path, UpdateError> {
    path.parent().ok_or_else(|| {
        UpdateError::InstallerPrecondition(format!("{} has no parent directory", path.display()))
    })
}

fn ensure_writable(dir: &Path) -> Result<(), UpdateError> {
    tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(dir)
        .map(drop)
        .map_err(|e| {
            UpdateError::InstallerPrecondition(format!("{} is not writable: {e}", dir.display()))
        })
}

/// Atomically replace `target` with a copy of `source`, marked executable.
fn replace_file(source: &Path, target: &Path) -> Result<(), UpdateError> {
    let mut staged = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile_in(parent_of(target)?)?;
    let mut input = File::open(source)?;
    std::io::copy(&mut input, staged.as_file_mut())?;
    staged.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o755))?;
    }

    staged
        .persist(target)
        .map_err(|e| UpdateError::InstallationFailed(format!("failed to replace {}: {}", target.display(), e.error)))?;
    Ok(())
}

/// Extract `archive` next to `bundle` and swap the bundles.
///
/// The previous bundle is put back if the swap fails.
fn swap_bundle(commands: &dyn SystemCommands, archive: &Path, bundle: &Path) -> Result<(), UpdateError> {
    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(parent_of(bundle)?)?;

    commands
        .run(
            DITTO,
            &[
                OsStr::new("-x"),
                OsStr::new("-k"),
                archive.as_os_str(),
                staging.path().as_os_str(),
            ],
        )?
        .check(DITTO)?;

    let new_bundle = find_app_bundle(staging.path())?;
    let previous = staging.path().join("previous.app");

    std::fs::rename(bundle, &previous)?;
    if let Err(e) = std::fs::rename(&new_bundle, bundle) {
        tracing::warn!(error = %e, "Bundle swap failed, restoring previous bundle");
        let _ = std::fs::rename(&previous, bundle);
        return Err(UpdateError::InstallationFailed(format!(
            "failed to move new bundle into place: {e}"
        )));
    }

    // The previous bundle goes away with the staging directory
    Ok(())
}

fn find_app_bundle(dir: &Path) -> Result<PathBuf, UpdateError> {
    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("app") && path.is_dir() {
            return Ok(path);
        }
    }
    Err(UpdateError::InstallationFailed(
        "archive contains no .app bundle".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use super::*;
    use crate::install::commands::fake::FakeCommands;
    use crate::manifest::Platform;

    struct Fixture {
        dir: tempfile::TempDir,
        cache: ArtifactCache,
        commands: Arc<FakeCommands>,
    }

    impl Fixture {
        fn new(commands: FakeCommands) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let cache = ArtifactCache::new(dir.path().join("cache"));
            Self {
                dir,
                cache,
                commands: Arc::new(commands),
            }
        }

        fn artifact(&self, name: &str, contents: &[u8]) -> PathBuf {
            let path = self.cache.entry_path(&Version::new(2, 0, 0), name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, contents).unwrap();
            path
        }

        fn stage(&self, artifact: PathBuf, package: PackageType, layout: &HostLayout) -> Result<ExitInstaller, UpdateError> {
            ExitInstaller::stage(
                Version::new(2, 0, 0),
                artifact,
                package,
                layout,
                self.cache.clone(),
                self.commands.clone(),
            )
        }
    }

    fn layout(platform: Platform, executable: PathBuf, appimage: Option<PathBuf>) -> HostLayout {
        HostLayout {
            platform,
            executable,
            appimage,
        }
    }

    #[test]
    fn test_appimage_requires_appimage_env() {
        let fx = Fixture::new(FakeCommands::new());
        let artifact = fx.artifact("Parley.AppImage", b"new");
        let host = layout(Platform::Linux, fx.dir.path().join("parley"), None);

        let result = fx.stage(artifact, PackageType::AppImage, &host);
        assert!(matches!(result, Err(UpdateError::InstallerPrecondition(_))));
    }

    #[test]
    fn test_appimage_replaced_at_exit() {
        let fx = Fixture::new(FakeCommands::new());
        let artifact = fx.artifact("Parley.AppImage", b"new build");
        let target = fx.dir.path().join("Parley.AppImage");
        std::fs::write(&target, b"old build").unwrap();
        let host = layout(Platform::Linux, target.clone(), Some(target.clone()));

        let installer = fx.stage(artifact.clone(), PackageType::AppImage, &host).unwrap();
        assert_eq!(installer.plan(), &InstallPlan::ReplaceAppImage { target: target.clone() });
        installer.run(true).unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"new build");
        assert!(!artifact.exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&target).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
        assert_eq!(fx.commands.spawned(), vec![target.display().to_string()]);
    }

    #[test]
    fn test_installer_exe_runs_silently() {
        let fx = Fixture::new(FakeCommands::new());
        let artifact = fx.artifact("Parley-Setup.exe", b"nsis");
        let host = layout(Platform::Windows, fx.dir.path().join("Parley.exe"), None);

        let installer = fx.stage(artifact.clone(), PackageType::InstallerExe, &host).unwrap();
        installer.run(false).unwrap();

        assert_eq!(fx.commands.spawned(), vec![format!("{} /S", artifact.display())]);
    }

    #[test]
    fn test_bundle_swap() {
        let fx = Fixture::new(FakeCommands::new());
        let artifact = fx.artifact("Parley-mac.zip", b"zip");
        let bundle = fx.dir.path().join("Applications").join("Parley.app");
        std::fs::create_dir_all(bundle.join("Contents").join("MacOS")).unwrap();
        std::fs::write(bundle.join("Contents").join("Info.plist"), b"old").unwrap();
        let exe = bundle.join("Contents").join("MacOS").join("Parley");
        let host = layout(Platform::Darwin, exe, None);

        let installer = fx.stage(artifact.clone(), PackageType::Zip, &host).unwrap();
        installer.run(false).unwrap();

        assert_eq!(std::fs::read(bundle.join("Contents").join("Info.plist")).unwrap(), b"new");
        assert!(!artifact.exists());
        // Staging directory and previous bundle are gone
        let leftovers: Vec<_> = std::fs::read_dir(bundle.parent().unwrap())
            .unwrap()
            .flatten()
            .map(|e| e.file_name())
            .collect();
        assert_eq!(leftovers, vec![OsString::from("Parley.app")]);
    }

    #[test]
    fn test_bundle_swap_requires_ditto() {
        let fx = Fixture::new(FakeCommands::new().unavailable("ditto"));
        let artifact = fx.artifact("Parley-mac.zip", b"zip");
        let exe = fx.dir.path().join("Parley.app").join("Contents").join("MacOS").join("Parley");
        let host = layout(Platform::Darwin, exe, None);

        let result = fx.stage(artifact, PackageType::Zip, &host);
        assert!(matches!(result, Err(UpdateError::InstallerPrecondition(_))));
    }

    #[test]
    fn test_failed_extraction_keeps_old_bundle() {
        let fx = Fixture::new(FakeCommands::new().failing("ditto"));
        let artifact = fx.artifact("Parley-mac.zip", b"zip");
        let bundle = fx.dir.path().join("Parley.app");
        std::fs::create_dir_all(bundle.join("Contents")).unwrap();
        std::fs::write(bundle.join("Contents").join("Info.plist"), b"old").unwrap();
        let host = layout(Platform::Darwin, bundle.join("Contents").join("MacOS").join("Parley"), None);

        let installer = fx.stage(artifact, PackageType::Zip, &host).unwrap();
        assert!(installer.run(false).is_err());
        assert_eq!(std::fs::read(bundle.join("Contents").join("Info.plist")).unwrap(), b"old");
    }

    #[test]
    fn test_disk_image_never_staged() {
        let fx = Fixture::new(FakeCommands::new());
        let artifact = fx.artifact("Parley.dmg", b"dmg");
        let host = layout(Platform::Darwin, fx.dir.path().join("parley"), None);

        let result = fx.stage(artifact, PackageType::DiskImage, &host);
        assert!(matches!(result, Err(UpdateError::InstallerPrecondition(_))));
    }
}
