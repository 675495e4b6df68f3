//! Release manifest verification.
//!
//! A release manifest lists the installable artifacts of one version and is
//! signed with Ed25519 over a canonical byte sequence. Both the release
//! tooling and the engine build those bytes with [`canonical_payload`], so
//! the signer and verifier cannot disagree about whitespace or field order.
//!
//! # Security
//!
//! - The signature is checked against a single pinned public key before any
//!   signed field is interpreted.
//! - Unknown fields are rejected so unsigned data cannot ride along.
//! - A manifest is only applicable if its version strictly exceeds the
//!   running version.

use base64::prelude::*;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::UpdateError;
use crate::hash;

/// File name of the manifest inside a release.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// Operating system an artifact targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "darwin")]
    Darwin,
    #[serde(rename = "linux")]
    Linux,
    #[serde(rename = "win32")]
    Windows,
}

impl Platform {
    /// Platform of the running binary, if it is one we ship for.
    pub fn current() -> Option<Self> {
        if cfg!(target_os = "macos") {
            Some(Self::Darwin)
        } else if cfg!(target_os = "linux") {
            Some(Self::Linux)
        } else if cfg!(target_os = "windows") {
            Some(Self::Windows)
        } else {
            None
        }
    }

    /// Wire name used in manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Darwin => "darwin",
            Self::Linux => "linux",
            Self::Windows => "win32",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "darwin" => Ok(Self::Darwin),
            "linux" => Ok(Self::Linux),
            "win32" => Ok(Self::Windows),
            other => Err(UpdateError::ConfigError(format!("unknown platform: {other}"))),
        }
    }
}

/// Packaging format of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageType {
    #[serde(rename = "dmg")]
    DiskImage,
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "AppImage")]
    AppImage,
    #[serde(rename = "exe")]
    InstallerExe,
}

impl PackageType {
    /// Wire name used in manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DiskImage => "dmg",
            Self::Zip => "zip",
            Self::AppImage => "AppImage",
            Self::InstallerExe => "exe",
        }
    }
}

impl std::fmt::Display for PackageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PackageType {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dmg" => Ok(Self::DiskImage),
            "zip" => Ok(Self::Zip),
            "AppImage" => Ok(Self::AppImage),
            "exe" => Ok(Self::InstallerExe),
            other => Err(UpdateError::ConfigError(format!("unknown package type: {other}"))),
        }
    }
}

/// One installable file of a release.
///
/// Field order is part of the signed encoding; do not reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Artifact {
    /// Bare file name, resolved against the release download location
    pub url: String,
    /// SHA-256 of the file, 64 lowercase hex characters
    pub sha256: String,
    /// Target operating system
    pub platform: Platform,
    /// Packaging format
    #[serde(rename = "type")]
    pub package: PackageType,
}

impl Artifact {
    fn validate(&self) -> Result<(), UpdateError> {
        if !is_bare_file_name(&self.url) {
            return Err(UpdateError::structure(format!(
                "artifact url must be a bare file name: {:?}",
                self.url
            )));
        }
        if !hash::is_digest_hex(&self.sha256) {
            return Err(UpdateError::structure(format!(
                "artifact {} has an invalid sha256",
                self.url
            )));
        }
        Ok(())
    }
}

/// A signed release manifest as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ReleaseManifest {
    /// Semantic version of the release
    pub version: String,
    /// Installable artifacts, in publisher order
    pub artifacts: Vec<Artifact>,
    /// Creation time (ISO-8601); advisory only
    pub created_at: String,
    /// Base64 Ed25519 signature over [`canonical_payload`]
    pub signature: String,
}

/// The signed portion of a manifest. Field order is the canonical order.
#[derive(Serialize)]
struct SignedPayload<'a> {
    version: &'a str,
    artifacts: &'a [Artifact],
    #[serde(rename = "createdAt")]
    created_at: &'a str,
}

/// Canonical bytes covered by the manifest signature.
///
/// Compact JSON of `{"version","artifacts","createdAt"}` in that order, each
/// artifact as `{"url","sha256","platform","type"}`, with no whitespace.
pub fn canonical_payload(
    version: &str,
    artifacts: &[Artifact],
    created_at: &str,
) -> Result<Vec<u8>, UpdateError> {
    Ok(serde_json::to_vec(&SignedPayload {
        version,
        artifacts,
        created_at,
    })?)
}

impl ReleaseManifest {
    /// Build and sign a manifest.
    pub fn sign(
        signing_key: &SigningKey,
        version: &Version,
        artifacts: Vec<Artifact>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, UpdateError> {
        let version = version.to_string();
        let created_at = created_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let payload = canonical_payload(&version, &artifacts, &created_at)?;
        let signature = signing_key.sign(&payload);

        Ok(Self {
            version,
            artifacts,
            created_at,
            signature: BASE64_STANDARD.encode(signature.to_bytes()),
        })
    }

    /// Parse a manifest document without verifying it.
    pub fn parse(data: &[u8]) -> Result<Self, UpdateError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Canonical signed bytes of this manifest.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, UpdateError> {
        canonical_payload(&self.version, &self.artifacts, &self.created_at)
    }

    /// Creation timestamp, if it parses. Never used for trust decisions.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    fn decode_signature(&self) -> Result<Signature, UpdateError> {
        let bytes = BASE64_STANDARD
            .decode(self.signature.trim())
            .map_err(|_| UpdateError::SignatureInvalid("signature is not valid base64".to_string()))?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| UpdateError::SignatureInvalid("signature has the wrong length".to_string()))?;
        Ok(Signature::from_bytes(&bytes))
    }
}

/// A trusted, applicable manifest and the artifact chosen for this system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedRelease {
    /// Release version
    pub version: Version,
    /// Artifact selected for the running platform and installer
    pub artifact: Artifact,
}

/// Verifies release manifests against the embedded publisher key.
///
/// # Example
///
/// ```ignore
/// use parley_updater::manifest::{ManifestVerifier, PackageType, Platform};
///
/// let verifier = ManifestVerifier::new(public_key, Platform::Darwin, PackageType::Zip);
/// let release = verifier.verify(&manifest_bytes, &current_version)?;
/// ```
#[derive(Debug, Clone)]
pub struct ManifestVerifier {
    /// Pinned publisher key
    public_key: VerifyingKey,
    /// Platform artifacts must target
    platform: Platform,
    /// Package type the installer consumes
    package: PackageType,
    /// Whether prerelease versions are applicable
    allow_prerelease: bool,
}

impl ManifestVerifier {
    /// Create a verifier for one platform and package type.
    pub fn new(public_key: VerifyingKey, platform: Platform, package: PackageType) -> Self {
        Self {
            public_key,
            platform,
            package,
            allow_prerelease: false,
        }
    }

    /// Accept prerelease versions as applicable.
    pub fn with_prerelease(mut self, allow: bool) -> Self {
        self.allow_prerelease = allow;
        self
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn package(&self) -> PackageType {
        self.package
    }

    /// Verify a raw manifest and select the artifact for this system.
    ///
    /// Steps, in order:
    /// 1. Parse the document (`MalformedManifest` on failure)
    /// 2. Rebuild the canonical signed bytes
    /// 3. Check the signature (`SignatureInvalid` on failure)
    /// 4. Validate the signed fields (`MalformedManifest`)
    /// 5. Compare versions (`NotNewer` unless strictly greater)
    /// 6. Pick the artifact (`NoMatchingArtifact` if none fits)
    pub fn verify(&self, data: &[u8], current: &Version) -> Result<VerifiedRelease, UpdateError> {
        let manifest = ReleaseManifest::parse(data)?;

        let payload = manifest.canonical_bytes()?;
        let signature = manifest.decode_signature()?;
        self.public_key.verify_strict(&payload, &signature).map_err(|e| {
            tracing::error!(version = %manifest.version, "Manifest signature rejected");
            UpdateError::from(e)
        })?;
        tracing::debug!(version = %manifest.version, "Manifest signature verified");

        let candidate = Version::parse(&manifest.version)?;
        for artifact in &manifest.artifacts {
            artifact.validate()?;
        }

        if candidate <= *current || (!candidate.pre.is_empty() && !self.allow_prerelease) {
            tracing::info!(
                current = %current,
                candidate = %candidate,
                "Manifest does not offer an applicable update"
            );
            return Err(UpdateError::NotNewer {
                current: current.clone(),
                candidate,
            });
        }

        let artifact = manifest
            .artifacts
            .iter()
            .find(|a| a.platform == self.platform && a.package == self.package)
            .cloned()
            .ok_or_else(|| UpdateError::NoMatchingArtifact {
                platform: self.platform.to_string(),
                package: self.package.to_string(),
            })?;

        tracing::info!(
            version = %candidate,
            artifact = %artifact.url,
            created_at = %manifest.created_at,
            "Manifest verified successfully"
        );

        Ok(VerifiedRelease {
            version: candidate,
            artifact,
        })
    }
}

/// Parse an Ed25519 public key.
///
/// Accepts 32 bytes as hex or base64, optionally prefixed with `ed25519:`.
pub fn parse_public_key(s: &str) -> Result<VerifyingKey, UpdateError> {
    let s = s.trim();
    let s = s.strip_prefix("ed25519:").unwrap_or(s);

    let bytes = hex::decode(s)
        .or_else(|_| BASE64_STANDARD.decode(s))
        .map_err(|_| UpdateError::ConfigError("public key is neither hex nor base64".to_string()))?;
    let bytes: [u8; 32] = bytes.try_into().map_err(|_| {
        UpdateError::ConfigError("Ed25519 public key must be 32 bytes".to_string())
    })?;

    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| UpdateError::ConfigError(format!("invalid Ed25519 public key: {e}")))
}

fn is_bare_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.contains("..")
        && !name.chars().any(char::is_control)
}
