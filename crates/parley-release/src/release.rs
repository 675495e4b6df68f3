//! Publisher-side operations: key generation, manifest signing and
//! verification.
//!
//! Signing goes through [`ReleaseManifest::sign`] and verification through
//! [`ManifestVerifier`], so the bytes signed here are exactly the bytes the
//! updater checks.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{anyhow, bail, Context};
use base64::prelude::*;
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use parley_updater::{
    hash, parse_public_key, Artifact, InstallStrategy, ManifestVerifier, PackageType, Platform,
    ReleaseManifest, UpdateError, VerifiedRelease,
};
use rand_core::OsRng;
use semver::Version;
use serde::Serialize;

use crate::output::Report;

/// An artifact given on the command line as `<path>:<platform>:<type>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSpec {
    pub path: PathBuf,
    pub platform: Platform,
    pub package: PackageType,
}

impl FromStr for ArtifactSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Split from the right so paths may contain ':'
        let mut parts = s.rsplitn(3, ':');
        let (Some(package), Some(platform), Some(path)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(format!("expected <path>:<platform>:<type>, got {s}"));
        };
        if path.is_empty() {
            return Err(format!("missing artifact path in {s}"));
        }

        Ok(Self {
            path: PathBuf::from(path),
            platform: platform.parse().map_err(|e: UpdateError| e.to_string())?,
            package: package.parse().map_err(|e: UpdateError| e.to_string())?,
        })
    }
}

/// Result of `keygen`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeygenReport {
    pub key_file: PathBuf,
    pub public_key_hex: String,
    pub public_key_base64: String,
}

impl Report for KeygenReport {
    fn to_text(&self) -> String {
        format!(
            "Signing key written to {}\nPublic key (hex):    {}\nPublic key (base64): {}",
            self.key_file.display(),
            self.public_key_hex,
            self.public_key_base64
        )
    }
}

/// Result of `sign`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignReport {
    pub manifest_file: PathBuf,
    pub version: String,
    pub artifacts: Vec<Artifact>,
}

impl Report for SignReport {
    fn to_text(&self) -> String {
        let mut text = format!(
            "Signed manifest for {} written to {}",
            self.version,
            self.manifest_file.display()
        );
        for artifact in &self.artifacts {
            text.push_str(&format!(
                "\n  {} ({} {}) sha256 {}",
                artifact.url, artifact.platform, artifact.package, artifact.sha256
            ));
        }
        text
    }
}

/// Result of a successful `verify`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub version: String,
    pub artifact: Artifact,
}

impl From<VerifiedRelease> for VerifyReport {
    fn from(release: VerifiedRelease) -> Self {
        Self {
            version: release.version.to_string(),
            artifact: release.artifact,
        }
    }
}

impl Report for VerifyReport {
    fn to_text(&self) -> String {
        format!(
            "Manifest verified: version {}\n  {} ({} {}) sha256 {}",
            self.version, self.artifact.url, self.artifact.platform, self.artifact.package, self.artifact.sha256
        )
    }
}

/// Generate a signing key and write it hex-encoded to `out`.
///
/// Refuses to overwrite an existing file unless `force` is set.
pub fn keygen(out: &Path, force: bool) -> anyhow::Result<KeygenReport> {
    if out.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", out.display());
    }

    let signing_key = SigningKey::generate(&mut OsRng);
    write_secret(out, hex::encode(signing_key.to_bytes()).as_bytes())
        .with_context(|| format!("failed to write {}", out.display()))?;

    let public = signing_key.verifying_key().to_bytes();
    tracing::info!(path = %out.display(), "Generated signing key");
    Ok(KeygenReport {
        key_file: out.to_path_buf(),
        public_key_hex: hex::encode(public),
        public_key_base64: BASE64_STANDARD.encode(public),
    })
}

/// Read a hex-encoded signing key written by [`keygen`].
pub fn load_signing_key(path: &Path) -> anyhow::Result<SigningKey> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let bytes = hex::decode(text.trim()).context("signing key is not valid hex")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("signing key must be 32 bytes"))?;
    Ok(SigningKey::from_bytes(&bytes))
}

/// Hash every artifact, sign the manifest and write it as pretty JSON.
///
/// Artifacts are listed under their file names; the updater resolves those
/// against the release location.
pub fn sign(
    key_file: &Path,
    version: &Version,
    artifacts: &[ArtifactSpec],
    created_at: Option<DateTime<Utc>>,
    out: &Path,
) -> anyhow::Result<SignReport> {
    if artifacts.is_empty() {
        bail!("at least one --artifact is required");
    }
    let signing_key = load_signing_key(key_file)?;

    let mut entries = Vec::with_capacity(artifacts.len());
    for spec in artifacts {
        let name = spec
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("{} has no usable file name", spec.path.display()))?;
        let sha256 = hash::digest_file(&spec.path)
            .with_context(|| format!("failed to hash {}", spec.path.display()))?;
        tracing::debug!(artifact = name, %sha256, "Hashed artifact");
        entries.push(Artifact {
            url: name.to_string(),
            sha256,
            platform: spec.platform,
            package: spec.package,
        });
    }

    let manifest = ReleaseManifest::sign(&signing_key, version, entries, created_at.unwrap_or_else(Utc::now))?;
    let json = serde_json::to_string_pretty(&manifest)?;
    fs::write(out, json + "\n").with_context(|| format!("failed to write {}", out.display()))?;

    tracing::info!(version = %version, path = %out.display(), "Manifest signed");
    Ok(SignReport {
        manifest_file: out.to_path_buf(),
        version: manifest.version,
        artifacts: manifest.artifacts,
    })
}

/// Verify a manifest file the way the updater does.
///
/// `package` defaults to what a trusted native install uses on `platform`.
pub fn verify(
    manifest: &Path,
    public_key: &str,
    current: &Version,
    platform: Platform,
    package: Option<PackageType>,
    allow_prerelease: bool,
) -> anyhow::Result<VerifiedRelease> {
    let data = fs::read(manifest).with_context(|| format!("failed to read {}", manifest.display()))?;
    let key = parse_public_key(public_key)?;
    let package = package.unwrap_or_else(|| InstallStrategy::Native.preferred_package(platform));

    let release = ManifestVerifier::new(key, platform, package)
        .with_prerelease(allow_prerelease)
        .verify(&data, current)?;
    Ok(release)
}

#[cfg(unix)]
fn write_secret(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    // mode() only applies to newly created files
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    file.write_all(b"\n")
}

#[cfg(not(unix))]
fn write_secret(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.write_all(b"\n")
}
