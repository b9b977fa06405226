//! # Configuration Management
//!
//! Handles all configuration for MnemoDB components. Every section has a
//! `Default`, and a full configuration can be loaded from or saved to TOML.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Size of the segment header: 3 magic bytes plus one compression flag.
pub const WAL_HEADER_SIZE: usize = 4;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub wal: WalConfig,
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| Error::Configuration {
            message: format!("failed to parse {}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Converts configuration to TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Configuration {
            message: format!("failed to serialize config: {}", e),
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.wal.validate()
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the filesystem object store.
    pub data_dir: PathBuf,
    /// Upper bound on bytes kept in the buffer pool free lists.
    pub buffer_pool_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            buffer_pool_bytes: 64 * 1024 * 1024, // 64MB
        }
    }
}

/// Write-ahead log configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WalConfig {
    /// Segment object names are `{segment_prefix}{index}`.
    pub segment_prefix: String,
    /// Capacity of one uncompressed segment, header excluded.
    pub max_segment_size: usize,
    /// Soft threshold: once the pending segment holds this many bytes it is
    /// written even if more entries are queued.
    pub flush_threshold: usize,
    /// How long the worker waits for new entries before re-checking state.
    pub idle_wait_ms: u64,
    /// Snappy-compress segments before writing them.
    pub compression: bool,
    /// Write attempts per segment before giving up. 0 retries forever.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_prefix: "wal.log.".to_string(),
            max_segment_size: 16 * 1024 * 1024, // 16MB
            flush_threshold: 4 * 1024 * 1024,   // 4MB
            idle_wait_ms: 100,
            compression: true,
            max_attempts: 0,
            initial_backoff_ms: 10,
            max_backoff_ms: 10_000,
        }
    }
}

impl WalConfig {
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    /// Largest serialized entry (frame included) that fits in one segment.
    pub fn max_entry_size(&self) -> usize {
        self.max_segment_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.segment_prefix.is_empty() {
            return Err(Error::Configuration {
                message: "wal.segment_prefix must not be empty".to_string(),
            });
        }
        if self.max_segment_size < 64 {
            return Err(Error::Configuration {
                message: format!(
                    "wal.max_segment_size must be at least 64 bytes, got {}",
                    self.max_segment_size
                ),
            });
        }
        if self.flush_threshold == 0 || self.flush_threshold > self.max_segment_size {
            return Err(Error::Configuration {
                message: format!(
                    "wal.flush_threshold must be in 1..={}, got {}",
                    self.max_segment_size, self.flush_threshold
                ),
            });
        }
        if self.initial_backoff_ms == 0 || self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Configuration {
                message: "wal backoff must satisfy 0 < initial_backoff_ms <= max_backoff_ms"
                    .to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mnemo.toml");

        let mut config = Config::default();
        config.wal.segment_prefix = "log/".to_string();
        config.wal.compression = false;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("[wal]\nmax_attempts = 5\n").unwrap();
        assert_eq!(config.wal.max_attempts, 5);
        assert_eq!(config.wal.segment_prefix, "wal.log.");
        assert_eq!(config.storage, StorageConfig::default());
    }

    #[test]
    fn test_rejects_threshold_above_segment_size() {
        let mut config = WalConfig::default();
        config.flush_threshold = config.max_segment_size + 1;
        assert!(matches!(config.validate(), Err(Error::Configuration { .. })));
    }
}
