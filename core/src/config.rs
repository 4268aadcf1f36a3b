use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Every tunable of the acquisition core. Built once by the host
/// application and handed to the manager and the cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub download_root: PathBuf,
    pub cache_root: PathBuf,
    pub placeholder_image: Option<PathBuf>,
    pub user_agent: String,
    pub queue: QueueConfig,
    pub transfer: TransferConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_workers: usize,
    pub max_attempts: u32,
    pub validation_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter_ratio: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub chunk_size: usize,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub progress_interval_bytes: u64,
    pub progress_flush_bytes: u64,
    pub speed_window_ms: u64,
    pub speed_limit_bytes_per_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub budget_bytes: u64,
    pub max_asset_bytes: u64,
    /// Fallback sources tried in order; `{platform}` and `{item}` are
    /// substituted with the url-encoded key parts.
    pub source_templates: Vec<String>,
    pub retry_delays_ms: Vec<u64>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from("downloads"),
            cache_root: PathBuf::from("assets/images/cache"),
            placeholder_image: None,
            user_agent: "EmuDrop/0.1".to_string(),
            queue: QueueConfig::default(),
            transfer: TransferConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_attempts: 5,
            validation_retries: 1,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            jitter_ratio: 0.2,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            progress_interval_ms: 250,
            progress_interval_bytes: 1024 * 1024,
            progress_flush_bytes: 4 * 1024 * 1024,
            speed_window_ms: 3_000,
            speed_limit_bytes_per_sec: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 500 * 1024 * 1024,
            max_asset_bytes: 16 * 1024 * 1024,
            source_templates: Vec::new(),
            retry_delays_ms: vec![1_000, 3_000, 5_000],
            connect_timeout_secs: 3,
            read_timeout_secs: 10,
        }
    }
}

impl AcquisitionConfig {
    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .map_err(|err| CoreError::Config(format!("{}: {}", path.display(), err)))?;
        let config: AcquisitionConfig = serde_json::from_str(&raw)
            .map_err(|err| CoreError::Config(format!("{}: {}", path.display(), err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.queue.max_workers == 0 {
            return Err(CoreError::Config("queue.max_workers must be at least 1".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(CoreError::Config("queue.max_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.queue.jitter_ratio) {
            return Err(CoreError::Config("queue.jitter_ratio must be within 0..=1".into()));
        }
        if self.transfer.chunk_size == 0 {
            return Err(CoreError::Config("transfer.chunk_size must be non-zero".into()));
        }
        if self.cache.max_asset_bytes == 0 {
            return Err(CoreError::Config("cache.max_asset_bytes must be non-zero".into()));
        }
        if self.user_agent.trim().is_empty() {
            return Err(CoreError::Config("user_agent must not be empty".into()));
        }
        Ok(())
    }
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl CacheConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{ "download_root": "/mnt/roms", "queue": { "max_workers": 3 } }"#,
        )
        .unwrap();

        let config = AcquisitionConfig::load(&path).unwrap();
        assert_eq!(config.download_root, PathBuf::from("/mnt/roms"));
        assert_eq!(config.queue.max_workers, 3);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.cache.retry_delays_ms, vec![1_000, 3_000, 5_000]);
    }

    #[test]
    fn rejects_empty_pool() {
        let mut config = AcquisitionConfig::default();
        config.queue.max_workers = 0;
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }
}
