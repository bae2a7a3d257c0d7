//! Run configuration.
//!
//! Values come from three layers, each overriding the previous one:
//! built-in defaults, an optional TOML file, and `WACORR_*` environment
//! variables (a `.env` file is honored through `dotenvy`).
//!
//! ```toml
//! extract_messages = true
//! merge_backups = true
//! download_enabled = false
//! download_connection_timeout_ms = 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Messages per index query batch.
pub const DEFAULT_SEARCH_BATCH_SIZE: usize = 512;

/// Concurrent media downloads per case run.
pub const DEFAULT_DOWNLOAD_POOL_SIZE: usize = 20;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CorrelatorConfig {
    /// Emit one unit per message besides the chat units.
    pub extract_messages: bool,
    /// Merge backups into their main database instead of reporting each copy.
    pub merge_backups: bool,
    /// Link media padded with trailing zeros by name and approximate size.
    pub link_media_by_name_and_approx_size_fallback: bool,
    pub download_connection_timeout_ms: u64,
    pub download_read_timeout_ms: u64,
    /// Fetch media still missing from the case from the network.
    pub download_enabled: bool,
    pub download_pool_size: usize,
    pub search_batch_size: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            extract_messages: true,
            merge_backups: false,
            link_media_by_name_and_approx_size_fallback: true,
            download_connection_timeout_ms: 500,
            download_read_timeout_ms: 500,
            download_enabled: false,
            download_pool_size: DEFAULT_DOWNLOAD_POOL_SIZE,
            search_batch_size: DEFAULT_SEARCH_BATCH_SIZE,
        }
    }
}

impl CorrelatorConfig {
    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        Ok(cfg)
    }

    /// Load a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        cfg.apply_env()?;
        cfg.normalize();
        Ok(cfg)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        let mut cfg: Self = toml::from_str(raw)?;
        cfg.normalize();
        Ok(cfg)
    }

    /// Override fields from `WACORR_*` variables. Unset variables are ignored.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_bool("WACORR_EXTRACT_MESSAGES")? {
            self.extract_messages = v;
        }
        if let Some(v) = env_bool("WACORR_MERGE_BACKUPS")? {
            self.merge_backups = v;
        }
        if let Some(v) = env_bool("WACORR_LINK_MEDIA_FALLBACK")? {
            self.link_media_by_name_and_approx_size_fallback = v;
        }
        if let Some(v) = env_bool("WACORR_DOWNLOAD_ENABLED")? {
            self.download_enabled = v;
        }
        if let Some(v) = env_num("WACORR_DOWNLOAD_CONNECT_TIMEOUT_MS")? {
            self.download_connection_timeout_ms = v;
        }
        if let Some(v) = env_num("WACORR_DOWNLOAD_READ_TIMEOUT_MS")? {
            self.download_read_timeout_ms = v;
        }
        if let Some(v) = env_num::<usize>("WACORR_DOWNLOAD_POOL_SIZE")? {
            self.download_pool_size = v;
        }
        if let Some(v) = env_num::<usize>("WACORR_SEARCH_BATCH_SIZE")? {
            self.search_batch_size = v;
        }
        self.normalize();
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.download_connection_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.download_read_timeout_ms)
    }

    /// The registry and download stages only matter when one of these is on.
    pub fn defers_to_merge_stage(&self) -> bool {
        self.merge_backups || self.download_enabled
    }

    fn normalize(&mut self) {
        if self.search_batch_size == 0 {
            self.search_batch_size = DEFAULT_SEARCH_BATCH_SIZE;
        }
        if self.download_pool_size == 0 {
            self.download_pool_size = 1;
        }
    }
}

fn env_bool(key: &'static str) -> Result<Option<bool>, ConfigError> {
    let Ok(raw) = dotenvy::var(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue { key, value: raw }),
    }
}

fn env_num<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    let Ok(raw) = dotenvy::var(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue { key, value: raw })
}
