//! Job queue configuration structures.

use resque_core::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for producers, workers and the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Backing store connection.
    #[serde(default)]
    pub redis: RedisConfig,

    /// Worker loop configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Delayed-schedule promoter configuration.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Status record configuration.
    #[serde(default)]
    pub status: StatusConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Namespace prepended to every key. A missing trailing `:` is added.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            connect_timeout_secs: default_connect_timeout(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RedisConfig {
    /// Returns connect timeout as Duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_key_prefix() -> String {
    "resque".to_string()
}

/// How a worker isolates the execution of one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationMode {
    /// Run each job in its own supervised task with its own store handle.
    #[default]
    Task,
    /// Run each job inside the worker loop.
    Inline,
}

/// Worker loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Queues to reserve from, in priority order. `*` means every known queue.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,

    /// Interval between reservation attempts in milliseconds. Also the
    /// upper bound of one blocking reservation wait.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Use a blocking multi-queue pop instead of polling.
    #[serde(default)]
    pub blocking: bool,

    /// Job isolation mode.
    #[serde(default)]
    pub isolation: IsolationMode,

    /// Install OS signal handlers that translate into control messages.
    #[serde(default = "default_install_signals")]
    pub install_signal_handlers: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
            interval_ms: default_interval_ms(),
            blocking: false,
            isolation: IsolationMode::default(),
            install_signal_handlers: default_install_signals(),
        }
    }
}

impl WorkerConfig {
    /// Returns the reservation interval as Duration.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_queues() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_interval_ms() -> u64 {
    5000
}

fn default_install_signals() -> bool {
    true
}

/// Delayed-schedule promoter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable the promoter loop.
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,

    /// Sleep between two scans in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    /// Returns the scan interval as Duration.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_poll_interval_secs() -> u64 {
    5
}

/// Status record configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Lifetime of a status record once it reaches a terminal state.
    #[serde(default = "default_status_ttl")]
    pub ttl_secs: u64,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_status_ttl(),
        }
    }
}

impl StatusConfig {
    /// Returns the terminal-state TTL as Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_status_ttl() -> u64 {
    86400 // 24 hours
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = JobsConfig::default();
        assert_eq!(config.redis.key_prefix, "resque");
        assert_eq!(config.worker.queues, vec!["default".to_string()]);
        assert_eq!(config.worker.interval(), Duration::from_secs(5));
        assert_eq!(config.worker.isolation, IsolationMode::Task);
        assert_eq!(config.status.ttl(), Duration::from_secs(86400));
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: JobsConfig =
            serde_json::from_str(r#"{"worker": {"blocking": true, "isolation": "inline"}}"#).unwrap();
        assert!(config.worker.blocking);
        assert_eq!(config.worker.isolation, IsolationMode::Inline);
        assert_eq!(config.worker.interval_ms, 5000);
        assert_eq!(config.scheduler.poll_interval_secs, 5);
    }
}
