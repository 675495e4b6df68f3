//! CLI command definitions and argument parsing

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use parley_updater::{PackageType, Platform};
use semver::Version;

use crate::output::{print_failure, print_success, OutputFormat};
use crate::release::{self, ArtifactSpec, VerifyReport};
use crate::ExitCode;

/// Parley release tooling - sign and check update manifests
#[derive(Parser, Debug)]
#[command(name = "parley-release")]
#[command(version, about = "Parley release tooling - sign and check update manifests")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format: text or json
    #[arg(long, default_value = "text", global = true)]
    pub output: OutputFormat,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Debug logging
    #[arg(long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a manifest signing key
    Keygen(KeygenArgs),
    /// Hash artifacts and write a signed manifest
    Sign(SignArgs),
    /// Check a manifest exactly as the updater would
    Verify(VerifyArgs),
}

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Where to write the hex-encoded signing key
    #[arg(long)]
    pub out: PathBuf,

    /// Overwrite an existing key file
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct SignArgs {
    /// Signing key written by `keygen`
    #[arg(long, env = "PARLEY_SIGNING_KEY_FILE")]
    pub key: PathBuf,

    /// Release version
    #[arg(long = "version")]
    pub release_version: Version,

    /// Artifact as <path>:<platform>:<type>, e.g. dist/Parley.dmg:darwin:dmg
    #[arg(long = "artifact", required = true)]
    pub artifacts: Vec<ArtifactSpec>,

    /// Creation time (RFC 3339); defaults to now
    #[arg(long)]
    pub created_at: Option<DateTime<Utc>>,

    /// Where to write the manifest
    #[arg(long, default_value = "manifest.json")]
    pub out: PathBuf,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// Manifest file to check
    #[arg(long)]
    pub manifest: PathBuf,

    /// Publisher public key, hex or base64
    #[arg(long, env = "PARLEY_UPDATE_PUBLIC_KEY")]
    pub public_key: String,

    /// Version the updater would be running
    #[arg(long)]
    pub current_version: Version,

    /// Platform to select for (darwin, linux, win32); defaults to this one
    #[arg(long)]
    pub platform: Option<Platform>,

    /// Package type to select (dmg, zip, AppImage, exe)
    #[arg(long)]
    pub package: Option<PackageType>,

    /// Accept prerelease versions
    #[arg(long)]
    pub allow_prerelease: bool,
}

impl Cli {
    /// Execute the CLI command
    pub fn execute(self) -> anyhow::Result<ExitCode> {
        let format = self.output;
        match self.command {
            Commands::Keygen(args) => {
                let report = release::keygen(&args.out, args.force)?;
                print_success(format, "keygen", &report)?;
                Ok(ExitCode::Success)
            }
            Commands::Sign(args) => {
                let report = release::sign(
                    &args.key,
                    &args.release_version,
                    &args.artifacts,
                    args.created_at,
                    &args.out,
                )?;
                print_success(format, "sign", &report)?;
                Ok(ExitCode::Success)
            }
            Commands::Verify(args) => args.execute(format),
        }
    }
}

impl VerifyArgs {
    fn execute(self, format: OutputFormat) -> anyhow::Result<ExitCode> {
        let Some(platform) = self.platform.or_else(Platform::current) else {
            anyhow::bail!("this system is not a release platform; pass --platform");
        };

        match release::verify(
            &self.manifest,
            &self.public_key,
            &self.current_version,
            platform,
            self.package,
            self.allow_prerelease,
        ) {
            Ok(verified) => {
                print_success(format, "verify", &VerifyReport::from(verified))?;
                Ok(ExitCode::Success)
            }
            Err(e) => {
                tracing::debug!(error = ?e, "Manifest rejected");
                print_failure(format, "verify", &format!("{e:#}"))?;
                Ok(ExitCode::Failure)
            }
        }
    }
}
