//! Error types for the update engine.

use semver::Version;
use thiserror::Error;

/// Errors that can occur during an update cycle.
///
/// Every variant except [`UpdateError::NotNewer`] ends the current cycle in
/// the `failed` phase. None of them are retried automatically.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// Network failure, timeout, or unreadable response body
    #[error("failed to fetch {url}: {reason}")]
    TransportFailure { url: String, reason: String },

    /// Server answered with a non-success status
    #[error("request to {url} failed with status {status}")]
    HttpStatus { url: String, status: u16 },

    /// Redirect chain exceeded the hop limit
    #[error("too many redirects ({hops}) while fetching {url}")]
    TooManyRedirects { url: String, hops: usize },

    /// Manifest could not be parsed or failed structural validation
    #[error("malformed manifest: {0}")]
    MalformedManifest(ManifestDefect),

    /// Manifest signature did not verify against the embedded key
    #[error("manifest signature verification failed: {0}")]
    SignatureInvalid(String),

    /// Manifest version does not strictly succeed the running version.
    /// Not a failure: the cycle simply has nothing to apply.
    #[error("no applicable update (current {current}, offered {candidate})")]
    NotNewer { current: Version, candidate: Version },

    /// Manifest has no artifact for this platform and package type
    #[error("no artifact for platform {platform} with package type {package}")]
    NoMatchingArtifact { platform: String, package: String },

    /// Downloaded bytes do not hash to the manifest entry
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    /// Installer cannot proceed on this system
    #[error("installer precondition failed: {0}")]
    InstallerPrecondition(String),

    /// Installation step failed after preconditions held
    #[error("installation failed: {0}")]
    InstallationFailed(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// What was wrong with a manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestDefect {
    /// Bytes are not a JSON document of the expected shape
    #[error("parse error: {0}")]
    Syntax(String),
    /// Document parsed but a field violates the manifest rules
    #[error("validation error: {0}")]
    Structure(String),
}

/// Coarse classification used to pick a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Parse,
    Validation,
    Integrity,
    Installer,
    Other,
}

impl UpdateError {
    /// Classify this error for sanitization.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::TransportFailure { .. } | Self::HttpStatus { .. } | Self::TooManyRedirects { .. } => {
                ErrorCategory::Network
            }
            Self::MalformedManifest(ManifestDefect::Syntax(_)) => ErrorCategory::Parse,
            Self::MalformedManifest(ManifestDefect::Structure(_))
            | Self::SignatureInvalid(_)
            | Self::NoMatchingArtifact { .. } => ErrorCategory::Validation,
            Self::HashMismatch { .. } => ErrorCategory::Integrity,
            Self::InstallerPrecondition(_) | Self::InstallationFailed(_) => ErrorCategory::Installer,
            Self::NotNewer { .. } | Self::ConfigError(_) | Self::IoError(_) => ErrorCategory::Other,
        }
    }

    /// True when the error means "nothing to apply" rather than a failure.
    pub fn is_no_update(&self) -> bool {
        matches!(self, Self::NotNewer { .. })
    }

    pub(crate) fn syntax(reason: impl Into<String>) -> Self {
        Self::MalformedManifest(ManifestDefect::Syntax(reason.into()))
    }

    pub(crate) fn structure(reason: impl Into<String>) -> Self {
        Self::MalformedManifest(ManifestDefect::Structure(reason.into()))
    }

    pub(crate) fn transport(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransportFailure {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for UpdateError {
    fn from(err: reqwest::Error) -> Self {
        let url = err
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        let reason = if err.is_timeout() {
            "request timed out".to_string()
        } else {
            err.to_string()
        };
        UpdateError::TransportFailure { url, reason }
    }
}

impl From<ed25519_dalek::SignatureError> for UpdateError {
    fn from(err: ed25519_dalek::SignatureError) -> Self {
        UpdateError::SignatureInvalid(err.to_string())
    }
}

impl From<serde_json::Error> for UpdateError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            serde_json::error::Category::Data => UpdateError::structure(err.to_string()),
            _ => UpdateError::syntax(err.to_string()),
        }
    }
}

impl From<semver::Error> for UpdateError {
    fn from(err: semver::Error) -> Self {
        UpdateError::structure(format!("invalid version: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_newer_is_no_update() {
        let err = UpdateError::NotNewer {
            current: Version::new(2, 0, 0),
            candidate: Version::new(1, 0, 0),
        };
        assert!(err.is_no_update());
        assert_eq!(err.category(), ErrorCategory::Other);
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            UpdateError::HttpStatus { url: "u".into(), status: 404 }.category(),
            ErrorCategory::Network
        );
        assert_eq!(UpdateError::syntax("eof").category(), ErrorCategory::Parse);
        assert_eq!(UpdateError::structure("bad sha").category(), ErrorCategory::Validation);
        assert_eq!(
            UpdateError::SignatureInvalid("x".into()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            UpdateError::HashMismatch { expected: "a".into(), actual: "b".into() }.category(),
            ErrorCategory::Integrity
        );
        assert_eq!(
            UpdateError::InstallerPrecondition("no hdiutil".into()).category(),
            ErrorCategory::Installer
        );
    }

    #[test]
    fn test_semver_error_is_structural() {
        let err: UpdateError = semver::Version::parse("not-a-version").unwrap_err().into();
        assert!(matches!(err, UpdateError::MalformedManifest(ManifestDefect::Structure(_))));
    }
}
