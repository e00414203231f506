//! Cache configuration.
//!
//! Settings may be given in a TOML file. Every key is optional and falls back to a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::debug;

fn cloudfs_runtime_dir() -> Option<PathBuf> {
    if let Some(path) = dirs::runtime_dir() {
        return Some(path.join("cloud-fs"));
    }

    dirs::home_dir().map(|home| home.join(".local").join("share").join("cloud-fs"))
}

fn default_cache_path() -> PathBuf {
    cloudfs_runtime_dir().map_or_else(
        || PathBuf::from("/tmp/cloud-fs/cache"),
        |rd| rd.join("cache"),
    )
}

const fn default_grace_period_ms() -> u64 {
    10_000
}

const fn default_max_concurrent_uploads() -> usize {
    4
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    Validation(Vec<String>),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-mount cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CacheConfig {
    /// Directory holding backing files and upload snapshots.
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,

    /// How long an unreferenced entry stays mapped after its upload finished.
    #[serde(default = "default_grace_period_ms")]
    pub eviction_grace_period_ms: u64,

    /// Upper bound on background uploads running at the same time.
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
            eviction_grace_period_ms: default_grace_period_ms(),
            max_concurrent_uploads: default_max_concurrent_uploads(),
        }
    }
}

impl CacheConfig {
    /// The eviction grace period as a [`Duration`].
    #[must_use]
    pub fn eviction_grace_period(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_period_ms)
    }

    /// Validate the configuration, reporting every problem found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_concurrent_uploads == 0 {
            errors.push("max-concurrent-uploads must be at least 1.".to_owned());
        } else if self.max_concurrent_uploads > Semaphore::MAX_PERMITS {
            errors.push(format!(
                "max-concurrent-uploads must be at most {}.",
                Semaphore::MAX_PERMITS
            ));
        }

        if !self.path.is_absolute() {
            errors.push(format!(
                "cache path '{}' must be absolute.",
                self.path.display()
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parse and validate a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::Validation)?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading cache configuration file.");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}
