//! Parley release tooling
//!
//! This crate provides the publisher side of the update pipeline:
//! - Generating Ed25519 signing keys
//! - Hashing artifacts and signing release manifests
//! - Verifying a manifest exactly as the updater would

pub mod cli;
pub mod output;
pub mod release;

pub use cli::Cli;
pub use output::OutputFormat;

/// Exit codes for CLI operations
///
/// - 0: Success
/// - 1: Failure - the command did not complete, or a manifest was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Success = 0,
    Failure = 1,
}

impl ExitCode {
    /// Convert to process exit code
    pub fn to_exit_code(self) -> std::process::ExitCode {
        std::process::ExitCode::from(self as u8)
    }
}
