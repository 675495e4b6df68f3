//! Configuration structures for the update engine.
//!
//! These are the fields the engine reads from the application's settings
//! file. Development-only fields (`dev_override_source`,
//! `allow_prerelease`) are loaded like any other field but only take effect
//! after passing through [`crate::source::SourceConfig::resolve`].

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Directory name used under platform cache locations.
const APP_DIR_NAME: &str = "Parley";

/// Update settings persisted by the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdaterSettings {
    /// Check on startup and periodically, and download automatically
    #[serde(default = "default_true")]
    pub auto_update: bool,

    /// Interval between automatic update checks in hours
    #[serde(default = "default_check_interval")]
    pub check_interval_hours: u32,

    /// Alternate release location (development builds only)
    #[serde(default)]
    pub dev_override_source: Option<String>,

    /// Offer prerelease versions (development builds only)
    #[serde(default)]
    pub allow_prerelease: bool,

    /// Artifact cache directory (empty = platform default)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            auto_update: true,
            check_interval_hours: default_check_interval(),
            dev_override_source: None,
            allow_prerelease: false,
            cache_dir: None,
            network: NetworkConfig::default(),
        }
    }
}

impl UpdaterSettings {
    /// Load configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, UpdateError> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self =
            toml::from_str(&content).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        Ok(settings)
    }

    /// Load configuration, falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, UpdateError> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "No updater settings found, using defaults");
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UpdateError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| UpdateError::ConfigError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Time between automatic checks.
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.check_interval_hours.max(1)) * 3600)
    }

    /// Artifact cache directory, using the platform default if unset.
    pub fn cache_dir(&self) -> PathBuf {
        match &self.cache_dir {
            Some(dir) => dir.clone(),
            None => default_cache_dir(),
        }
    }
}

/// Network configuration for manifest fetches and downloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP/TLS connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole-request timeout for the manifest in seconds
    #[serde(default = "default_manifest_timeout")]
    pub manifest_timeout_secs: u64,

    /// Maximum silence between body chunks in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Whole-transfer timeout for an artifact in seconds
    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            manifest_timeout_secs: default_manifest_timeout(),
            read_timeout_secs: default_read_timeout(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn manifest_timeout(&self) -> Duration {
        Duration::from_secs(self.manifest_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

// Default value functions for serde
fn default_true() -> bool {
    true
}

fn default_check_interval() -> u32 {
    6
}

fn default_connect_timeout() -> u64 {
    15
}

fn default_manifest_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

fn default_download_timeout() -> u64 {
    30 * 60
}

/// Platform default cache directory for downloaded artifacts.
fn default_cache_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            return PathBuf::from(local).join(APP_DIR_NAME).join("updates");
        }
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Caches")
                .join(APP_DIR_NAME)
                .join("updates");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(cache_home) = std::env::var("XDG_CACHE_HOME") {
            return PathBuf::from(cache_home)
                .join(APP_DIR_NAME.to_lowercase())
                .join("updates");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join(".cache")
                .join(APP_DIR_NAME.to_lowercase())
                .join("updates");
        }
    }

    std::env::temp_dir().join(APP_DIR_NAME).join("updates")
}
