//! Release source resolution.
//!
//! Computes where the manifest and artifacts are fetched from. Production
//! builds always use the publisher identity compiled into the binary.
//! Development builds may point at an alternate location (a local directory
//! or a test server) through settings or the environment.
//!
//! # Security
//!
//! [`SourceConfig`] can only be constructed through [`SourceConfig::resolve`]
//! or [`SourceConfig::production`]. `resolve` takes the build mode from how
//! the binary was compiled, never from its caller, and discards every
//! override in a production build before anything else looks at it. The
//! resolver therefore has no code path that reads an override in production.

use std::collections::HashMap;
use std::path::Path;

use semver::Version;
use url::Url;

use crate::config::UpdaterSettings;
use crate::error::UpdateError;
use crate::manifest::{Artifact, MANIFEST_FILE_NAME};

/// Environment variable holding a development release location.
pub const ENV_UPDATE_SOURCE: &str = "PARLEY_UPDATE_SOURCE";

/// Environment variable enabling prerelease updates in development.
pub const ENV_ALLOW_PRERELEASE: &str = "PARLEY_ALLOW_PRERELEASE";

/// How the running binary was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    Development,
    Production,
}

impl BuildMode {
    /// Mode of this binary, fixed at compile time.
    pub const fn current() -> Self {
        if cfg!(debug_assertions) {
            Self::Development
        } else {
            Self::Production
        }
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Self::Development)
    }
}

/// Release publisher baked into the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublisherIdentity {
    /// Releases host, e.g. `github.com`
    pub host: &'static str,
    /// Repository owner
    pub owner: &'static str,
    /// Repository name
    pub repo: &'static str,
}

impl PublisherIdentity {
    pub const fn new(host: &'static str, owner: &'static str, repo: &'static str) -> Self {
        Self { host, owner, repo }
    }

    fn base(&self) -> Result<Url, UpdateError> {
        let mut url = Url::parse(&format!("https://{}/", self.host))
            .map_err(|e| UpdateError::ConfigError(format!("invalid release host: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| UpdateError::ConfigError("release host cannot be a base URL".to_string()))?
            .pop_if_empty()
            .extend([self.owner, self.repo, "releases"]);
        Ok(url)
    }
}

/// Read-only view of process environment variables.
pub trait EnvSource {
    fn var(&self, key: &str) -> Option<String>;
}

/// The real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn var(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}

/// Mode-aware source configuration.
///
/// In a production build `dev_override_source` is always `None` and
/// `allow_prerelease` is always `false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    mode: BuildMode,
    dev_override_source: Option<Url>,
    allow_prerelease: bool,
}

impl SourceConfig {
    /// Apply the production forcing rule to persisted settings and the
    /// environment, for the mode this binary was compiled in.
    ///
    /// Development builds honor the environment first, then settings. An
    /// override that is neither a URL nor an absolute directory path is
    /// ignored with a warning.
    pub fn resolve(settings: &UpdaterSettings, env: &dyn EnvSource) -> Self {
        Self::resolve_in(BuildMode::current(), settings, env)
    }

    /// [`SourceConfig::resolve`] as if compiled in `mode`.
    #[cfg(test)]
    pub(crate) fn resolve_as(mode: BuildMode, settings: &UpdaterSettings, env: &dyn EnvSource) -> Self {
        Self::resolve_in(mode, settings, env)
    }

    fn resolve_in(mode: BuildMode, settings: &UpdaterSettings, env: &dyn EnvSource) -> Self {
        match mode {
            BuildMode::Production => {
                if settings.dev_override_source.is_some() || env.var(ENV_UPDATE_SOURCE).is_some() {
                    tracing::warn!("Ignoring update source override in production build");
                }
                Self::production()
            }
            BuildMode::Development => {
                let raw = env
                    .var(ENV_UPDATE_SOURCE)
                    .filter(|s| !s.trim().is_empty())
                    .or_else(|| settings.dev_override_source.clone())
                    .filter(|s| !s.trim().is_empty());
                let dev_override_source = raw.and_then(|raw| match parse_override(&raw) {
                    Some(url) => {
                        tracing::info!(source = %url, "Using development update source");
                        Some(url)
                    }
                    None => {
                        tracing::warn!(source = %raw, "Ignoring unusable development update source");
                        None
                    }
                });
                let allow_prerelease = env
                    .var(ENV_ALLOW_PRERELEASE)
                    .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                    .unwrap_or(settings.allow_prerelease);

                Self {
                    mode,
                    dev_override_source,
                    allow_prerelease,
                }
            }
        }
    }

    /// Configuration of a production build.
    pub fn production() -> Self {
        Self {
            mode: BuildMode::Production,
            dev_override_source: None,
            allow_prerelease: false,
        }
    }

    pub fn mode(&self) -> BuildMode {
        self.mode
    }

    pub fn is_development_build(&self) -> bool {
        self.mode.is_development()
    }

    pub fn dev_override_source(&self) -> Option<&Url> {
        self.dev_override_source.as_ref()
    }

    pub fn allow_prerelease(&self) -> bool {
        self.allow_prerelease
    }
}

/// Computes manifest and artifact locations.
#[derive(Debug, Clone)]
pub struct SourceResolver {
    publisher: PublisherIdentity,
    config: SourceConfig,
}

impl SourceResolver {
    pub fn new(publisher: PublisherIdentity, config: SourceConfig) -> Self {
        Self { publisher, config }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    /// Where to fetch the manifest from.
    ///
    /// Production: `https://<host>/<owner>/<repo>/releases/latest/download/manifest.json`.
    pub fn manifest_location(&self) -> Result<Url, UpdateError> {
        match &self.config.dev_override_source {
            Some(base) => join_file(base, MANIFEST_FILE_NAME),
            None => {
                let mut url = self.publisher.base()?;
                push_segments(&mut url, &["latest", "download", MANIFEST_FILE_NAME])?;
                Ok(url)
            }
        }
    }

    /// Where to download `artifact` of `version` from.
    ///
    /// Production: `https://<host>/<owner>/<repo>/releases/download/<version>/<url>`.
    pub fn artifact_location(&self, version: &Version, artifact: &Artifact) -> Result<Url, UpdateError> {
        match &self.config.dev_override_source {
            Some(base) => join_file(base, &artifact.url),
            None => {
                let mut url = self.publisher.base()?;
                push_segments(&mut url, &["download", &version.to_string(), &artifact.url])?;
                Ok(url)
            }
        }
    }
}

fn parse_override(raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if let Ok(url) = Url::parse(raw) {
        if matches!(url.scheme(), "http" | "https" | "file") && !url.cannot_be_a_base() {
            return Some(url);
        }
        // Windows drive letters parse as a one-letter scheme
        if url.scheme().len() > 1 {
            return None;
        }
    }
    let path = Path::new(raw);
    if path.is_absolute() {
        Url::from_directory_path(path).ok()
    } else {
        None
    }
}

fn join_file(base: &Url, name: &str) -> Result<Url, UpdateError> {
    let mut url = base.clone();
    push_segments(&mut url, &[name])?;
    Ok(url)
}

fn push_segments(url: &mut Url, segments: &[&str]) -> Result<(), UpdateError> {
    let shown = url.to_string();
    url.path_segments_mut()
        .map_err(|_| UpdateError::ConfigError(format!("{shown} cannot be a base URL")))?
        .pop_if_empty()
        .extend(segments);
    Ok(())
}
