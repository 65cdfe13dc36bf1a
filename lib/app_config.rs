//! Module for application configuration settings.
//!
//! User configurations may be specified in a TOML configuration file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

fn adb_fs_data_dir() -> Option<PathBuf> {
    let runtime_dir = dirs::runtime_dir();
    if let Some(path) = runtime_dir {
        return Some(path.join("adb-fs"));
    }

    let home_dir = dirs::home_dir();
    if let Some(path) = home_dir {
        return Some(path.join(".local").join("share").join("adb-fs"));
    }

    None
}

fn default_mount_point() -> PathBuf {
    adb_fs_data_dir().map_or_else(|| PathBuf::from("/tmp/adb-fs/mnt"), |rd| rd.join("mnt"))
}

fn current_uid() -> u32 {
    nix::unistd::Uid::current().as_raw()
}

fn current_gid() -> u32 {
    nix::unistd::Gid::current().as_raw()
}

const fn default_ttl_ms() -> u64 {
    300
}

/// Directory listing cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// How long a listing stays fresh, in milliseconds. Zero disables caching.
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,

    /// Grace period before a listing invalidated by a write is dropped, in milliseconds.
    #[serde(default)]
    pub invalidation_delay_ms: u64,
}

impl CacheConfig {
    /// [`ttl_ms`](Self::ttl_ms) as a [`Duration`].
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// [`invalidation_delay_ms`](Self::invalidation_delay_ms) as a [`Duration`].
    #[must_use]
    pub fn invalidation_delay(&self) -> Duration {
        Duration::from_millis(self.invalidation_delay_ms)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_ttl_ms(),
            invalidation_delay_ms: 0,
        }
    }
}

/// Application configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// The mount point for the filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    /// The user owning every file. If not specified, the current user.
    #[serde(default = "current_uid")]
    pub uid: u32,

    /// The group owning every file. If not specified, the current group.
    #[serde(default = "current_gid")]
    pub gid: u32,

    /// Let users other than the mounting one access the mount.
    #[serde(default)]
    pub allow_other: bool,

    /// Directory listing cache settings.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount_point: default_mount_point(),
            uid: current_uid(),
            gid: current_gid(),
            allow_other: false,
            cache: CacheConfig::default(),
        }
    }
}

/// Why a configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document parsed but holds invalid values.
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    /// The document is not valid TOML for [`Config`].
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    /// The file could not be read.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns:
    /// - `Ok(())` if the configuration is valid.
    /// - `Err(Vec<String>)` containing a list of validation error messages otherwise.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.mount_point.is_absolute() {
            errors.push(format!(
                "Mount point '{}' is not an absolute path.",
                self.mount_point.display()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    /// Loads and validates config from a single TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    #[must_use]
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("adb-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("adb-fs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/adb-fs/config.toml"));

        paths
    }

    /// Loads the first config file found on [`config_search_paths`](Self::config_search_paths),
    /// or `None` if there is none.
    #[must_use]
    pub fn discover() -> Option<Result<Self, ConfigError>> {
        Self::config_search_paths()
            .into_iter()
            .find(|p| p.exists())
            .map(|path| Self::load(&path))
    }
}
