//! Configuration structures.
//!
//! Configuration is loaded from JSON config files and environment variables.
//! Every section has defaults so an empty document is a valid config.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::errors::{Error, Result};
use crate::partition;

/// Global configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Partitioning and health monitoring.
    #[serde(default)]
    pub sharding: ShardingConfig,

    /// Inter-shard messaging.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Parse a JSON config document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `JEEVES_SHARD_*` environment overrides on top of this config.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(total) = env_number("JEEVES_SHARD_TOTAL")? {
            self.sharding.total_shards = u32::try_from(total).map_err(|_| {
                Error::validation(format!("JEEVES_SHARD_TOTAL out of range: {}", total))
            })?;
        }
        if let Some(workload) = env_number("JEEVES_SHARD_WORKLOAD")? {
            self.sharding.workload_size = Some(workload);
        }
        if let Some(units) = env_number("JEEVES_SHARD_UNITS_PER_SHARD")? {
            self.sharding.units_per_shard = units;
        }
        self.validate()
    }

    /// Reject configurations that would make the sweep or requests misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.sharding.health_check_interval.is_zero() {
            return Err(Error::validation("health_check_interval must be non-zero"));
        }
        if self.sharding.shard_timeout.is_zero() {
            return Err(Error::validation("shard_timeout must be non-zero"));
        }
        if self.ipc.default_request_timeout.is_zero() {
            return Err(Error::validation("default_request_timeout must be non-zero"));
        }
        if self.ipc.channel_prefix.is_empty() {
            return Err(Error::validation("channel_prefix cannot be empty"));
        }
        Ok(())
    }
}

fn env_number(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| Error::validation(format!("{}={:?}: {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

/// Partitioning and health monitoring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardingConfig {
    /// Total shard count. Zero means "derive from `workload_size`".
    #[serde(default)]
    pub total_shards: u32,

    /// Observed workload (e.g. connection groups) used to derive the shard count.
    #[serde(default)]
    pub workload_size: Option<u64>,

    /// Workload units a single shard is expected to own.
    pub units_per_shard: u64,

    /// How often the liveness sweep runs.
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Staleness after which a shard is declared dead.
    #[serde(with = "humantime_serde")]
    pub shard_timeout: Duration,
}

impl ShardingConfig {
    /// Shard count to monitor: the explicit value, else derived from workload.
    ///
    /// Returns 0 when neither is configured.
    pub fn resolved_total_shards(&self) -> u32 {
        if self.total_shards > 0 {
            return self.total_shards;
        }
        match self.workload_size {
            Some(workload) => partition::calculate_shard_count(workload, self.units_per_shard),
            None => 0,
        }
    }
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            total_shards: 0,
            workload_size: None,
            units_per_shard: 1000,
            health_check_interval: Duration::from_secs(30),
            shard_timeout: Duration::from_secs(60),
        }
    }
}

/// Inter-shard messaging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Prefix for bus channel names (`{prefix}:{shard}` and `{prefix}:broadcast`).
    pub channel_prefix: String,

    /// Deadline applied by `request` when the caller gives none.
    #[serde(with = "humantime_serde")]
    pub default_request_timeout: Duration,

    /// Maximum remembered envelope ids.
    pub dedup_capacity: usize,

    /// How long an envelope id is remembered.
    #[serde(with = "humantime_serde")]
    pub dedup_ttl: Duration,
}

impl IpcConfig {
    /// Private channel owned by `shard`.
    pub fn shard_channel(&self, shard: crate::types::ShardId) -> String {
        format!("{}:{}", self.channel_prefix, shard)
    }

    /// Shared channel every gateway subscribes to.
    pub fn broadcast_channel(&self) -> String {
        format!("{}:broadcast", self.channel_prefix)
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            channel_prefix: "shard:ipc".to_string(),
            default_request_timeout: Duration::from_secs(30),
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_secs(300),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}
