//! External programs used by the installers.
//!
//! Installers never call `std::process::Command` directly; they go through
//! [`SystemCommands`] so the install flows can be exercised without
//! `hdiutil`, `codesign` or `ditto` present.

use std::ffi::OsStr;
use std::io;
use std::process::{Command, Stdio};

use crate::error::UpdateError;

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Turn an unsuccessful run into an installation error.
    pub fn check(self, program: &str) -> Result<Self, UpdateError> {
        if self.success {
            Ok(self)
        } else {
            Err(UpdateError::InstallationFailed(format!(
                "{program} failed: {}",
                self.stderr.trim()
            )))
        }
    }
}

/// Runs external programs. Calls block; use from `spawn_blocking`.
pub trait SystemCommands: Send + Sync + std::fmt::Debug {
    /// Run `program` to completion and capture its output.
    fn run(&self, program: &str, args: &[&OsStr]) -> Result<CommandOutput, UpdateError>;

    /// Start `program` without waiting for it.
    fn spawn_detached(&self, program: &OsStr, args: &[&OsStr]) -> Result<(), UpdateError>;

    /// Whether `program` can be found on `PATH`.
    fn is_available(&self, program: &str) -> bool;
}

/// The real operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCommands;

impl SystemCommands for HostCommands {
    fn run(&self, program: &str, args: &[&OsStr]) -> Result<CommandOutput, UpdateError> {
        tracing::debug!(program, ?args, "Running command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_error(OsStr::new(program), e))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn_detached(&self, program: &OsStr, args: &[&OsStr]) -> Result<(), UpdateError> {
        tracing::debug!(?program, ?args, "Spawning detached process");
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| spawn_error(program, e))?;
        Ok(())
    }

    fn is_available(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

fn spawn_error(program: &OsStr, err: io::Error) -> UpdateError {
    let program = program.to_string_lossy();
    if err.kind() == io::ErrorKind::NotFound {
        UpdateError::InstallerPrecondition(format!("{program} is not available"))
    } else {
        UpdateError::InstallationFailed(format!("failed to run {program}: {err}"))
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use std::sync::Mutex;

    use super::*;

    /// Records invocations instead of running anything.
    ///
    /// `ditto` is emulated by creating `Parley.app` in its destination so
    /// bundle swaps can be exercised.
    #[derive(Debug, Default)]
    pub(crate) struct FakeCommands {
        calls: Mutex<Vec<String>>,
        spawned: Mutex<Vec<String>>,
        unavailable: Vec<String>,
        failing: Vec<String>,
        stderr: String,
    }

    impl FakeCommands {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn unavailable(mut self, program: &str) -> Self {
            self.unavailable.push(program.to_string());
            self
        }

        pub(crate) fn failing(mut self, program: &str) -> Self {
            self.failing.push(program.to_string());
            self
        }

        pub(crate) fn with_stderr(mut self, stderr: &str) -> Self {
            self.stderr = stderr.to_string();
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn spawned(&self) -> Vec<String> {
            self.spawned.lock().unwrap().clone()
        }
    }

    fn line(program: &OsStr, args: &[&OsStr]) -> String {
        std::iter::once(program)
            .chain(args.iter().copied())
            .map(|s| s.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    impl SystemCommands for FakeCommands {
        fn run(&self, program: &str, args: &[&OsStr]) -> Result<CommandOutput, UpdateError> {
            if !self.is_available(program) {
                return Err(UpdateError::InstallerPrecondition(format!("{program} is not available")));
            }
            self.calls.lock().unwrap().push(line(OsStr::new(program), args));

            if self.failing.iter().any(|p| p == program) {
                return Ok(CommandOutput {
                    success: false,
                    stdout: String::new(),
                    stderr: format!("{program}: simulated failure"),
                });
            }
            if program == "ditto" {
                if let Some(dest) = args.last() {
                    let bundle = std::path::Path::new(dest).join("Parley.app").join("Contents");
                    std::fs::create_dir_all(&bundle)?;
                    std::fs::write(bundle.join("Info.plist"), b"new")?;
                }
            }
            Ok(CommandOutput {
                success: true,
                stdout: String::new(),
                stderr: self.stderr.clone(),
            })
        }

        fn spawn_detached(&self, program: &OsStr, args: &[&OsStr]) -> Result<(), UpdateError> {
            self.spawned.lock().unwrap().push(line(program, args));
            Ok(())
        }

        fn is_available(&self, program: &str) -> bool {
            !self.unavailable.iter().any(|p| p == program)
        }
    }
}
