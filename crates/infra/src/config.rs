//! Engine configuration.
//!
//! Everything is read from `TASKFORGE_*` environment variables with defaults
//! matching a typical deployment (10s poll, 10min lease timeout, 7 day
//! retention, 30s backoff base, 3 retries).

use std::time::Duration;

use thiserror::Error;

use taskforge_core::{DEFAULT_MAX_RETRIES, QueueName, RetryPolicy};

pub const DEFAULT_NOTIFY_CHANNEL: &str = "taskforge:jobs";

const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_LEASE_TIMEOUT_MINUTES: u64 = 10;
const DEFAULT_RETENTION_DAYS: u64 = 7;
const DEFAULT_RETRY_BASE_DELAY_SECS: u64 = 30;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

/// Process-wide engine settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Postgres connection string; `None` means the host runs in-memory.
    pub database_url: Option<String>,
    pub poll_interval: Duration,
    pub lease_timeout: Duration,
    pub retention: Duration,
    pub retry_base_delay: Duration,
    pub max_retries: u32,
    pub notify_redis_url: Option<String>,
    pub notify_channel: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            lease_timeout: minutes(DEFAULT_LEASE_TIMEOUT_MINUTES),
            retention: days(DEFAULT_RETENTION_DAYS),
            retry_base_delay: Duration::from_secs(DEFAULT_RETRY_BASE_DELAY_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            notify_redis_url: None,
            notify_channel: DEFAULT_NOTIFY_CHANNEL.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup (the environment, a map in
    /// tests, ...). Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let number = |var: &'static str, default: u64| -> Result<u64, ConfigError> {
            match get(var) {
                None => Ok(default),
                Some(value) => value
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidNumber { var, value }),
            }
        };
        let positive = |var: &'static str, default: u64| -> Result<u64, ConfigError> {
            match number(var, default)? {
                0 => Err(ConfigError::Zero { var }),
                n => Ok(n),
            }
        };

        let max_retries = match get("TASKFORGE_MAX_RETRIES") {
            None => DEFAULT_MAX_RETRIES,
            Some(value) => value.parse::<u32>().map_err(|_| ConfigError::InvalidNumber {
                var: "TASKFORGE_MAX_RETRIES",
                value,
            })?,
        };

        Ok(Self {
            database_url: get("TASKFORGE_DATABASE_URL"),
            poll_interval: Duration::from_secs(positive(
                "TASKFORGE_POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )?),
            lease_timeout: minutes(positive(
                "TASKFORGE_LEASE_TIMEOUT_MINUTES",
                DEFAULT_LEASE_TIMEOUT_MINUTES,
            )?),
            retention: days(number("TASKFORGE_RETENTION_DAYS", DEFAULT_RETENTION_DAYS)?),
            retry_base_delay: Duration::from_secs(number(
                "TASKFORGE_RETRY_BASE_DELAY_SECS",
                DEFAULT_RETRY_BASE_DELAY_SECS,
            )?),
            max_retries,
            notify_redis_url: get("TASKFORGE_NOTIFY_REDIS_URL"),
            notify_channel: get("TASKFORGE_NOTIFY_CHANNEL")
                .unwrap_or_else(|| DEFAULT_NOTIFY_CHANNEL.to_string()),
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.retry_base_delay)
    }
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(60))
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(24 * 60 * 60))
}

/// Per-queue settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub name: QueueName,
    /// Jobs leased per tick (`N`)
    pub parallelism: usize,
    pub poll_interval: Duration,
    /// Processing rows locked longer than this are reclaimed
    pub lease_timeout: Duration,
    /// Terminal rows older than this are swept
    pub retention: Duration,
    pub retry_policy: RetryPolicy,
    /// Retry ceiling for jobs enqueued without one
    pub default_max_retries: u32,
    /// Exhausted jobs go to the dead-letter store instead of `failed`
    pub dead_letter: bool,
    /// Back live dedup with a unique index where the store supports it
    pub unique_dedup: bool,
    pub sweep_each_tick: bool,
}

impl QueueOptions {
    pub fn new(name: QueueName) -> Self {
        Self::from_config(name, &EngineConfig::default())
    }

    pub fn from_config(name: QueueName, config: &EngineConfig) -> Self {
        Self {
            name,
            parallelism: 1,
            poll_interval: config.poll_interval,
            lease_timeout: config.lease_timeout,
            retention: config.retention,
            retry_policy: config.retry_policy(),
            default_max_retries: config.max_retries,
            dead_letter: false,
            unique_dedup: false,
            sweep_each_tick: true,
        }
    }

    /// Zero is treated as one.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_default_max_retries(mut self, max_retries: u32) -> Self {
        self.default_max_retries = max_retries;
        self
    }

    pub fn with_dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter = enabled;
        self
    }

    pub fn with_unique_dedup(mut self, enabled: bool) -> Self {
        self.unique_dedup = enabled;
        self
    }

    pub fn with_sweep_each_tick(mut self, enabled: bool) -> Self {
        self.sweep_each_tick = enabled;
        self
    }
}
