use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AgentMemConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub backpressure: BackpressureConfig,
    pub cache: CacheConfig,
    pub retry: RetryConfig,
    pub health: HealthConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackpressureConfig {
    pub default_max_concurrent: usize,
    pub default_queue_size: usize,
    pub default_max_tokens: f64,
    /// Tokens per second.
    pub default_refill_rate: f64,
    pub acquire_timeout_ms: Option<u64>,
    pub memory_threshold: f64,
    pub monitor_interval_ms: u64,
    /// Overrides physical memory as the pressure limit.
    pub heap_limit_mb: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_ms: Option<u64>,
    pub max_memory_mb: Option<f64>,
    pub pressure_check_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_agentmem_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            busy_timeout_ms: 5000,
        }
    }
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            default_max_concurrent: 10,
            default_queue_size: 1000,
            default_max_tokens: 10.0,
            default_refill_rate: 10.0,
            acquire_timeout_ms: None,
            memory_threshold: 0.85,
            monitor_interval_ms: 5000,
            heap_limit_mb: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 500,
            ttl_ms: Some(5 * 60 * 1000),
            max_memory_mb: None,
            pressure_check_interval_ms: 100,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 30_000,
            max_reconnect_attempts: 3,
            reconnect_delay_ms: 1000,
        }
    }
}

/// Returns `~/.agentmem/`, or `./.agentmem/` when no home directory is known.
pub fn default_agentmem_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agentmem")
}

/// Returns the default config file path: `~/.agentmem/config.toml`
pub fn default_config_path() -> PathBuf {
    default_agentmem_dir().join("config.toml")
}

impl AgentMemConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            AgentMemConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides (AGENTMEM_DB, AGENTMEM_LOG_LEVEL,
    /// AGENTMEM_MEMORY_THRESHOLD, AGENTMEM_MAX_RETRIES). Unparseable numbers are ignored.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("AGENTMEM_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("AGENTMEM_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("AGENTMEM_MEMORY_THRESHOLD") {
            match val.parse() {
                Ok(threshold) => self.backpressure.memory_threshold = threshold,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid AGENTMEM_MEMORY_THRESHOLD"),
            }
        }
        if let Ok(val) = std::env::var("AGENTMEM_MAX_RETRIES") {
            match val.parse() {
                Ok(retries) => self.retry.max_retries = retries,
                Err(_) => tracing::warn!(value = %val, "ignoring invalid AGENTMEM_MAX_RETRIES"),
            }
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AgentMemConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.storage.busy_timeout_ms, 5000);
        assert_eq!(config.backpressure.memory_threshold, 0.85);
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.retry.initial_delay_ms <= config.retry.max_delay_ms);
        assert!(config.storage.db_path.ends_with("memory.db"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
db_path = "/tmp/test.db"

[backpressure]
default_max_concurrent = 4
acquire_timeout_ms = 2500

[cache]
max_memory_mb = 64.0

[retry]
max_retries = 5
"#;
        let config: AgentMemConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.backpressure.default_max_concurrent, 4);
        assert_eq!(config.backpressure.acquire_timeout_ms, Some(2500));
        assert_eq!(config.cache.max_memory_mb, Some(64.0));
        assert_eq!(config.retry.max_retries, 5);
        // defaults still apply for unset fields
        assert_eq!(config.backpressure.default_queue_size, 1000);
        assert_eq!(config.retry.backoff_multiplier, 2.0);
        assert_eq!(config.health.max_reconnect_attempts, 3);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = AgentMemConfig::default();
        std::env::set_var("AGENTMEM_DB", "/tmp/override.db");
        std::env::set_var("AGENTMEM_LOG_LEVEL", "trace");
        std::env::set_var("AGENTMEM_MEMORY_THRESHOLD", "0.7");
        std::env::set_var("AGENTMEM_MAX_RETRIES", "not-a-number");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.backpressure.memory_threshold, 0.7);
        assert_eq!(config.retry.max_retries, 3);

        // Clean up
        std::env::remove_var("AGENTMEM_DB");
        std::env::remove_var("AGENTMEM_LOG_LEVEL");
        std::env::remove_var("AGENTMEM_MEMORY_THRESHOLD");
        std::env::remove_var("AGENTMEM_MAX_RETRIES");
    }

    #[test]
    fn tilde_expands_to_home() {
        let expanded = expand_tilde("~/data/memory.db");
        if dirs::home_dir().is_some() {
            assert!(!expanded.starts_with("~"));
        }
        assert_eq!(expand_tilde("/abs/path.db"), PathBuf::from("/abs/path.db"));
    }
}
