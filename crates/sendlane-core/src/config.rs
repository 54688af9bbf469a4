//! Sendlane configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SendlaneError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendlaneConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub pools: PoolConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl SendlaneConfig {
    /// Load config from the default path (~/.sendlane/config.toml), falling
    /// back to defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() { Self::load_from(&path) } else { Ok(Self::default()) }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SendlaneError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SendlaneError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Default config path.
    pub fn default_path() -> PathBuf {
        std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".sendlane")
            .join("config.toml")
    }

    fn validate(&self) -> Result<()> {
        if self.delivery.min_delay_secs > self.delivery.max_delay_secs {
            return Err(SendlaneError::Config(format!(
                "min_delay_secs ({}) exceeds max_delay_secs ({})",
                self.delivery.min_delay_secs, self.delivery.max_delay_secs
            )));
        }
        if self.delivery.retry_attempts == 0 {
            return Err(SendlaneError::Config("retry_attempts must be at least 1".into()));
        }
        if self.pools.max_workers_per_pool == 0 {
            return Err(SendlaneError::Config("max_workers_per_pool must be at least 1".into()));
        }
        Ok(())
    }
}

/// Where durable state lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from("sendlane.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: default_store_path() }
    }
}

/// Per-device send pacing, batching, and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Fallback pacing bounds for messages that carry none of their own.
    #[serde(default = "default_min_delay")]
    pub min_delay_secs: u32,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u32,
    /// Rows fetched per device per loop iteration.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Attempt ceiling; beyond it a message is marked permanently failed.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base backoff between attempts; multiplied by the attempt number.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Bound on a worker's in-memory queue view.
    #[serde(default = "default_queue_size")]
    pub worker_queue_size: u32,
    /// Extra pause every N messages, breaking up burst patterns.
    #[serde(default = "default_backoff_every")]
    pub batch_backoff_every: u32,
    #[serde(default = "default_backoff_secs")]
    pub batch_backoff_secs: u64,
    /// A worker whose queue stays empty this long reports idle and becomes
    /// eligible for recycling.
    #[serde(default = "default_idle_secs")]
    pub idle_worker_secs: u64,
}

fn default_min_delay() -> u32 { 10 }
fn default_max_delay() -> u32 { 30 }
fn default_batch_size() -> u32 { 100 }
fn default_retry_attempts() -> u32 { 3 }
fn default_retry_delay() -> u64 { 60 }
fn default_queue_size() -> u32 { 1000 }
fn default_backoff_every() -> u32 { 50 }
fn default_backoff_secs() -> u64 { 120 }
fn default_idle_secs() -> u64 { 300 }

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            min_delay_secs: default_min_delay(),
            max_delay_secs: default_max_delay(),
            batch_size: default_batch_size(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay(),
            worker_queue_size: default_queue_size(),
            batch_backoff_every: default_backoff_every(),
            batch_backoff_secs: default_backoff_secs(),
            idle_worker_secs: default_idle_secs(),
        }
    }
}

/// Pool registry ceilings and teardown timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_workers")]
    pub max_workers_per_pool: u32,
    #[serde(default = "default_max_pools")]
    pub max_pools_per_user: u32,
    /// Quiescence window after completion before teardown runs.
    #[serde(default = "default_grace")]
    pub pool_cleanup_grace_secs: u64,
    #[serde(default = "default_completion_check")]
    pub completion_check_secs: u64,
    #[serde(default = "default_progress_log")]
    pub progress_log_secs: u64,
}

fn default_max_workers() -> u32 { 50 }
fn default_max_pools() -> u32 { 100 }
fn default_grace() -> u64 { 300 }
fn default_completion_check() -> u64 { 10 }
fn default_progress_log() -> u64 { 30 }

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers_per_pool: default_max_workers(),
            max_pools_per_user: default_max_pools(),
            pool_cleanup_grace_secs: default_grace(),
            completion_check_secs: default_completion_check(),
            progress_log_secs: default_progress_log(),
        }
    }
}

/// Trigger scheduler tick intervals and claim leasing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_campaign_tick")]
    pub campaign_tick_secs: u64,
    #[serde(default = "default_sequence_tick")]
    pub sequence_tick_secs: u64,
    /// A contact claim not cleared within this window is treated as
    /// abandoned and becomes claimable again.
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,
    /// Due contacts fetched per sequence tick.
    #[serde(default = "default_sched_batch")]
    pub batch_size: u32,
    /// Rows stuck pending/queued beyond this go terminal failed.
    #[serde(default = "default_expiry_hours")]
    pub message_expiry_hours: u32,
}

fn default_campaign_tick() -> u64 { 60 }
fn default_sequence_tick() -> u64 { 30 }
fn default_claim_lease() -> u64 { 300 }
fn default_sched_batch() -> u32 { 1000 }
fn default_expiry_hours() -> u32 { 24 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            campaign_tick_secs: default_campaign_tick(),
            sequence_tick_secs: default_sequence_tick(),
            claim_lease_secs: default_claim_lease(),
            batch_size: default_sched_batch(),
            message_expiry_hours: default_expiry_hours(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SendlaneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delivery.retry_attempts, 3);
        assert_eq!(config.pools.max_workers_per_pool, 50);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
            [delivery]
            min_delay_secs = 5
            max_delay_secs = 15

            [pools]
            max_workers_per_pool = 2
        "#;
        let config: SendlaneConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.delivery.min_delay_secs, 5);
        assert_eq!(config.delivery.max_delay_secs, 15);
        assert_eq!(config.pools.max_workers_per_pool, 2);
        // untouched sections keep their defaults
        assert_eq!(config.scheduler.campaign_tick_secs, 60);
    }

    #[test]
    fn test_inverted_delay_bounds_rejected() {
        let mut config = SendlaneConfig::default();
        config.delivery.min_delay_secs = 60;
        config.delivery.max_delay_secs = 10;
        assert!(config.validate().is_err());
    }
}
