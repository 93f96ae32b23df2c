use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Path of the embedded SQLite database file.
    #[serde(default = "default_store_path")]
    pub path: String,
    /// Base URL of the remote replica; sync is disabled when absent.
    #[serde(default)]
    pub remote_url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Passed to the storage engine as-is. A plain SQLite build ignores it.
    #[serde(default)]
    pub encryption_key: Option<String>,
    /// WAL journal mode when true, TRUNCATE otherwise.
    #[serde(default = "default_durable_writes")]
    pub durable_writes: bool,
    #[serde(default = "default_lock_wait_ms")]
    pub lock_wait_ms: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_store_path() -> String {
    Paths::new().store_db().display().to_string()
}

fn default_durable_writes() -> bool {
    true
}

fn default_lock_wait_ms() -> u64 {
    5000
}

fn default_max_connections() -> usize {
    4
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            remote_url: None,
            auth_token: None,
            encryption_key: None,
            durable_writes: default_durable_writes(),
            lock_wait_ms: default_lock_wait_ms(),
            max_connections: default_max_connections(),
        }
    }
}

impl StoreConfig {
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_capacity() -> usize {
    256
}

fn default_cache_ttl_secs() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default = "default_sync_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_sync_batch_size")]
    pub batch_size: u32,
}

fn default_sync_interval_secs() -> u64 {
    300
}

fn default_sync_batch_size() -> u32 {
    100
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_sync_interval_secs(),
            batch_size: default_sync_batch_size(),
        }
    }
}

impl SyncConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    #[serde(default = "default_max_sessions_per_tenant")]
    pub max_sessions_per_tenant: usize,
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Idle sessions older than this are reclaimed by cleanup.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_max_sessions_per_tenant() -> usize {
    3
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_max_idle_secs() -> u64 {
    300
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_tenant: default_max_sessions_per_tenant(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            max_idle_secs: default_max_idle_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Startup validation. Configuration errors are fatal and never retried.
    pub fn validate(&self) -> Result<()> {
        if self.store.path.trim().is_empty() {
            return Err(Error::Config("store.path must not be empty".to_string()));
        }
        if self.store.max_connections == 0 {
            return Err(Error::Config(
                "store.maxConnections must be at least 1".to_string(),
            ));
        }
        if let Some(remote) = &self.store.remote_url {
            let parsed = url::Url::parse(remote)
                .map_err(|e| Error::Config(format!("store.remoteUrl is malformed: {}", e)))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(Error::Config(format!(
                    "store.remoteUrl must be http(s), got '{}'",
                    parsed.scheme()
                )));
            }
        }
        if let Some(key) = &self.store.encryption_key {
            if key.trim().is_empty() {
                return Err(Error::Config(
                    "store.encryptionKey must not be empty when set".to_string(),
                ));
            }
        }
        if self.pool.max_sessions_per_tenant == 0 {
            return Err(Error::Config(
                "pool.maxSessionsPerTenant must be at least 1".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(Error::Config(
                "cache.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_malformed_remote_url() {
        let mut config = Config::default();
        config.store.remote_url = Some("not a url".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.store.remote_url = Some("ftp://replica.example.com".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.store.remote_url = Some("https://replica.example.com".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_zero_connections() {
        let mut config = Config::default();
        config.store.max_connections = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"store": {"path": "/tmp/test.db"}}"#).unwrap();
        assert_eq!(config.store.path, "/tmp/test.db");
        assert_eq!(config.store.max_connections, 4);
        assert_eq!(config.cache.capacity, 256);
        assert_eq!(config.pool.max_sessions_per_tenant, 3);
    }
}
