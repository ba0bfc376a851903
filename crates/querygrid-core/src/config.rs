//! querygrid.toml configuration parser.
//!
//! Every recognised option has a default, so an empty file (or no file)
//! yields a usable configuration. Keys are snake_case; the camelCase spelling
//! used by the application layer is accepted as an alias.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryGridConfig {
    // ── Connection pool ──────────────────────────────────────────────
    #[serde(alias = "poolMin")]
    pub pool_min: usize,
    #[serde(alias = "poolMax")]
    pub pool_max: usize,
    #[serde(alias = "acquireTimeoutMs")]
    pub acquire_timeout_ms: u64,
    #[serde(alias = "idleTimeoutMs")]
    pub idle_timeout_ms: u64,
    #[serde(alias = "healthCheckIntervalMs")]
    pub health_check_interval_ms: u64,
    #[serde(alias = "drainTimeoutMs")]
    pub drain_timeout_ms: u64,

    // ── Query cache ──────────────────────────────────────────────────
    #[serde(alias = "cacheCapacity")]
    pub cache_capacity: usize,
    #[serde(alias = "cacheShards")]
    pub cache_shards: usize,
    #[serde(alias = "defaultTtlMs")]
    pub default_ttl_ms: u64,
    #[serde(alias = "sweepIntervalMs")]
    pub sweep_interval_ms: u64,

    // ── Query optimizer ──────────────────────────────────────────────
    #[serde(alias = "batchWindowMs")]
    pub batch_window_ms: u64,
    #[serde(alias = "maxBatchSize")]
    pub max_batch_size: usize,
    #[serde(alias = "maxCostScore")]
    pub max_cost_score: u32,

    // ── Bulk processor ───────────────────────────────────────────────
    #[serde(alias = "chunkSize")]
    pub chunk_size: usize,
    #[serde(alias = "maxConcurrentChunks")]
    pub max_concurrent_chunks: usize,
    #[serde(alias = "retryAttempts")]
    pub retry_attempts: u32,
    #[serde(alias = "maxFailureReasons")]
    pub max_failure_reasons: usize,

    // ── Backoff (bulk retries and subscription reconnects) ───────────
    #[serde(alias = "backoffBaseMs")]
    pub backoff_base_ms: u64,
    #[serde(alias = "backoffMaxMs")]
    pub backoff_max_ms: u64,

    // ── Metrics ──────────────────────────────────────────────────────
    #[serde(alias = "metricsBuffer")]
    pub metrics_buffer: usize,
    #[serde(alias = "metricsRetentionMs")]
    pub metrics_retention_ms: u64,
}

impl Default for QueryGridConfig {
    fn default() -> Self {
        Self {
            pool_min: 2,
            pool_max: 10,
            acquire_timeout_ms: 5_000,
            idle_timeout_ms: 300_000,
            health_check_interval_ms: 30_000,
            drain_timeout_ms: 30_000,
            cache_capacity: 10_000,
            cache_shards: 16,
            default_ttl_ms: 60_000,
            sweep_interval_ms: 10_000,
            batch_window_ms: 2,
            max_batch_size: 16,
            max_cost_score: 1_000,
            chunk_size: 100,
            max_concurrent_chunks: 4,
            retry_attempts: 3,
            max_failure_reasons: 10,
            backoff_base_ms: 100,
            backoff_max_ms: 10_000,
            metrics_buffer: 8_192,
            metrics_retention_ms: 300_000,
        }
    }
}

impl QueryGridConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: QueryGridConfig =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Reject combinations no component can honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_max == 0 {
            return Err(ConfigError::Invalid("pool_max must be at least 1".into()));
        }
        if self.pool_min > self.pool_max {
            return Err(ConfigError::Invalid(format!(
                "pool_min ({}) exceeds pool_max ({})",
                self.pool_min, self.pool_max
            )));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::Invalid("cache_capacity must be at least 1".into()));
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be at least 1".into()));
        }
        if self.max_concurrent_chunks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_chunks must be at least 1".into(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid("retry_attempts must be at least 1".into()));
        }
        if self.backoff_base_ms > self.backoff_max_ms {
            return Err(ConfigError::Invalid(format!(
                "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_base_ms, self.backoff_max_ms
            )));
        }
        if self.metrics_buffer == 0 {
            return Err(ConfigError::Invalid("metrics_buffer must be at least 1".into()));
        }
        Ok(())
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn metrics_retention(&self) -> Duration {
        Duration::from_millis(self.metrics_retention_ms)
    }
}
