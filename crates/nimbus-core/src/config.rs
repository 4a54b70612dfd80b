//! Configuration for NimbusFS.
//!
//! Typed structs mapping the YAML configuration file, with defaults,
//! loading, and validation. CLI flags override individual fields after
//! loading (see `nimbus-cli`).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub transfer: TransferConfig,
    pub delta: DeltaConfig,
    pub network: NetworkConfig,
    pub fuse: FuseConfig,
    pub logging: LoggingConfig,
}

/// Local cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Root directory holding metadata.db and the body store.
    pub dir: PathBuf,
    /// Idle seconds after which a clean body becomes evictable.
    pub expiration_secs: u64,
    /// How often the eviction sweep runs, in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            expiration_secs: 30 * 24 * 3600,
            sweep_interval_secs: 3600,
        }
    }
}

/// Download / upload tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Maximum concurrent downloads.
    pub download_workers: usize,
    /// Maximum concurrent uploads.
    pub upload_workers: usize,
    /// Bodies at or below this size go up in a single PUT.
    pub small_upload_threshold: u64,
    /// Chunk size for resumable upload sessions. Must stay a multiple of
    /// 320 KiB per the session protocol.
    pub upload_chunk_size: u64,
    /// Downloads above this size use ranged requests.
    pub range_get_threshold: u64,
    /// Chunk size for ranged downloads.
    pub download_chunk_size: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_workers: 16,
            upload_workers: 4,
            small_upload_threshold: 4 * 1024 * 1024,
            upload_chunk_size: 10 * 1024 * 1024,
            range_get_threshold: 4 * 1024 * 1024,
            download_chunk_size: 10 * 1024 * 1024,
        }
    }
}

/// Change-feed polling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeltaConfig {
    /// Seconds between polls when the mount is quiet.
    pub interval_secs: u64,
    /// Seconds between polls while the mount is in active use.
    pub active_interval_secs: u64,
    /// How long after the last FUSE operation the active cadence holds.
    pub active_window_secs: u64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            active_interval_secs: 60,
            active_window_secs: 120,
        }
    }
}

/// Remote call policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Hard per-request deadline, seconds.
    pub request_timeout_secs: u64,
    /// Maximum retry attempts for retryable error kinds.
    pub max_retries: u32,
    /// Initial backoff, milliseconds; doubles per attempt with jitter.
    pub backoff_base_ms: u64,
    /// Backoff ceiling, milliseconds.
    pub backoff_cap_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 60,
            max_retries: 5,
            backoff_base_ms: 500,
            backoff_cap_ms: 30_000,
        }
    }
}

/// FUSE mount settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseConfig {
    /// Volume name shown to the kernel and in /etc/mtab.
    pub mount_name: String,
    /// Pass the kernel debug flag through to fuser.
    pub kernel_debug: bool,
    /// Kernel background-request cap.
    pub max_background: u16,
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            mount_name: "onedrive".to_string(),
            kernel_debug: false,
            max_background: 64,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Optional log file; stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Loads configuration from a YAML file, filling defaults for any
    /// field the file omits.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;
        let config: Config =
            serde_yaml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer.download_workers == 0 || self.transfer.upload_workers == 0 {
            return Err(ConfigError::Invalid(
                "transfer worker counts must be at least 1".to_string(),
            ));
        }
        if self.transfer.upload_chunk_size % (320 * 1024) != 0 {
            return Err(ConfigError::Invalid(
                "upload_chunk_size must be a multiple of 320 KiB".to_string(),
            ));
        }
        if self.delta.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "delta interval must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Cache directory for a specific mount, escaped the same way for
    /// every provider: `<cache-root>/<mount-name-escaped>/`.
    pub fn mount_cache_dir(&self) -> PathBuf {
        let escaped: String = self
            .fuse
            .mount_name
            .chars()
            .map(|c| if c == '/' || c == ':' { '_' } else { c })
            .collect();
        self.cache.dir.join(escaped)
    }
}

/// Errors from configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, String),
    #[error("Failed to parse config: {0}")]
    Parse(String),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

fn default_cache_dir() -> PathBuf {
    std::env::var_os("XDG_CACHE_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cache")))
        .unwrap_or_else(|| PathBuf::from("/var/cache"))
        .join("nimbusfs")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delta.interval_secs, 300);
        assert_eq!(config.transfer.small_upload_threshold, 4 * 1024 * 1024);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "delta:\n  interval_secs: 42").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.delta.interval_secs, 42);
        assert_eq!(config.transfer.download_workers, 16);
    }

    #[test]
    fn test_chunk_size_alignment_enforced() {
        let mut config = Config::default();
        config.transfer.upload_chunk_size = 1000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let mut config = Config::default();
        config.transfer.download_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mount_cache_dir_escaping() {
        let mut config = Config::default();
        config.cache.dir = PathBuf::from("/tmp/cache");
        config.fuse.mount_name = "onedrive:work".to_string();
        assert_eq!(
            config.mount_cache_dir(),
            PathBuf::from("/tmp/cache/onedrive_work")
        );
    }
}
