//! # parley-updater
//!
//! Secure self-update engine for the Parley desktop client.
//!
//! This crate handles:
//! - Release manifest verification with a pinned Ed25519 key
//! - Release source resolution with a hard development/production boundary
//! - Artifact download into a version-keyed cache with SHA-256 verification
//! - Platform-specific installation: exit-time native installs, or a mounted
//!   disk image for builds without a trusted code signature
//! - A single-owner state machine that publishes every state change
//!
//! ## Security
//!
//! - Manifests are verified against the embedded public key before any
//!   signed field is used, and only strictly newer versions are applied
//! - Artifacts are hash-verified before they are staged or mounted
//! - Production builds ignore every source override, from settings or
//!   the environment
//! - User-visible failure text is sanitized in production builds

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod hash;
pub mod install;
pub mod machine;
pub mod manifest;
pub mod progress;
#[cfg(test)]
mod proptests;
pub mod sanitize;
pub mod source;
pub mod transport;

// Re-export main types for convenience
pub use cache::ArtifactCache;
pub use config::{NetworkConfig, UpdaterSettings};
pub use engine::{EngineConfig, Request, Shutdown, ShutdownReason, UpdateEngine};
pub use error::{ErrorCategory, ManifestDefect, UpdateError};
pub use install::{
    ArtifactInstaller, CleanupReport, CommandOutput, DiskImageMounter, ExitInstaller, HostCommands,
    HostLayout, InstallPlan, InstallStrategy, SystemCommands,
};
pub use machine::{Effect, Event, Phase, Rejected, StateSink, UpdateMachine, UpdateState};
pub use manifest::{
    canonical_payload, parse_public_key, Artifact, ManifestVerifier, PackageType, Platform,
    ReleaseManifest, VerifiedRelease,
};
pub use progress::Progress;
pub use sanitize::{sanitize, sanitize_message};
pub use source::{BuildMode, EnvSource, ProcessEnv, PublisherIdentity, SourceConfig, SourceResolver};
pub use transport::{Download, HttpTransport, ReleaseTransport};
