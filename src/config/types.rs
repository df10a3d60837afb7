//! Configuration type definitions.
//!
//! This module contains the type definitions for YAML configuration structures:
//! global scheduler settings, job files, schedules and retry policies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::core::job::OverlapPolicy;
use crate::core::retry::RetryCondition;
use crate::scheduler::{MissedTickPolicy, SchedulerConfig};

use super::error::ConfigError;

/// Global configuration (tickwork.yaml).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Seconds between scheduler ticks.
    pub tick_interval_secs: Option<u64>,
    /// What to do with occurrences missed while the scheduler was not looking.
    pub missed_ticks: Option<MissedTickPolicy>,
    /// Maximum lateness, in seconds, at which a missed occurrence still fires.
    pub misfire_threshold_secs: Option<u64>,
    /// Seconds shutdown waits for in-flight runs.
    pub shutdown_grace_secs: Option<u64>,
    /// Timeout for jobs that do not set their own.
    pub default_timeout_secs: Option<u64>,
    /// Run history kept per job.
    pub max_runs_per_job: Option<usize>,
    /// Deployment environment matched against job allow-lists.
    pub environment: Option<String>,
    /// Default timezone for cron schedules.
    pub default_timezone: Option<String>,
    /// Default retry policy for jobs without one.
    pub default_retry: Option<RetryConfig>,
    /// Storage configuration.
    pub storage: Option<StorageConfig>,
}

impl GlobalConfig {
    /// Scheduler settings, falling back to defaults for anything unset.
    pub fn scheduler_config(&self) -> Result<SchedulerConfig, ConfigError> {
        let mut config = SchedulerConfig::default();

        if let Some(secs) = self.tick_interval_secs {
            if secs == 0 {
                return Err(ConfigError::InvalidConfig(
                    "tick_interval_secs must be positive".into(),
                ));
            }
            config.tick_interval = Duration::from_secs(secs);
        }
        if let Some(policy) = self.missed_ticks {
            config.missed_ticks = policy;
        }
        if let Some(secs) = self.misfire_threshold_secs {
            config.misfire_threshold = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = self.shutdown_grace_secs {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = self.default_timeout_secs {
            if secs == 0 {
                return Err(ConfigError::InvalidConfig(
                    "default_timeout_secs must be positive".into(),
                ));
            }
            config.default_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(max) = self.max_runs_per_job {
            if max == 0 {
                return Err(ConfigError::InvalidConfig(
                    "max_runs_per_job must be at least 1".into(),
                ));
            }
            config.max_runs_per_job = Some(max);
        }
        config.environment = self.environment.clone();

        Ok(config)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StorageConfig {
    /// In-memory storage (default, non-persistent).
    #[serde(rename = "memory")]
    #[default]
    Memory,
    /// SQLite storage.
    #[serde(rename = "sqlite")]
    Sqlite {
        /// Path to the database file.
        path: String,
    },
}

/// Job configuration from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Job identifier.
    pub id: String,
    /// Human-readable name. Defaults to the id.
    pub name: Option<String>,
    /// Optional description.
    pub description: Option<String>,
    /// When the job runs.
    pub schedule: ScheduleConfig,
    /// Program to run. Exactly one of `command` and `url` is set.
    pub command: Option<String>,
    /// HTTP request to send instead of a command.
    pub url: Option<UrlConfig>,
    /// Program arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory.
    pub working_dir: Option<String>,
    /// Extra environment variables for the command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Per-run timeout in seconds.
    pub timeout_secs: Option<u64>,
    /// Retry policy.
    pub retry: Option<RetryConfig>,
    /// What to do when the job comes due while a run is in flight.
    #[serde(default)]
    pub overlap: OverlapPolicy,
    /// Jobs whose latest run must have succeeded.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Environments in which the job may run. Empty means all.
    #[serde(default)]
    pub environments: Vec<String>,
    /// Whether the job is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// HTTP request configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UrlConfig {
    /// A GET request to this URL.
    Simple(String),
    /// A request with method, headers or body.
    Request {
        endpoint: String,
        /// HTTP method. Defaults to GET.
        method: Option<String>,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        body: Option<String>,
    },
}

impl UrlConfig {
    pub fn endpoint(&self) -> &str {
        match self {
            UrlConfig::Simple(url) => url,
            UrlConfig::Request { endpoint, .. } => endpoint,
        }
    }
}

/// Schedule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleConfig {
    /// Cron expression or `@` shortcut.
    Simple(String),
    /// Cron expression with timezone.
    Cron {
        /// Cron expression or shortcut.
        cron: String,
        /// Timezone for the schedule.
        timezone: Option<String>,
    },
    /// Fixed interval, like `30s` or `1h30m`.
    Interval {
        every: String,
        /// Land occurrences on multiples of this duration.
        align: Option<String>,
    },
    /// A single run at an RFC 3339 instant.
    Once { at: DateTime<Utc> },
}

impl ScheduleConfig {
    /// Get the timezone, if specified.
    pub fn timezone(&self) -> Option<&str> {
        match self {
            ScheduleConfig::Cron { timezone, .. } => timezone.as_deref(),
            _ => None,
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay strategy. Without one, retries go out on the next tick.
    pub backoff: Option<BackoffConfig>,
    /// Retry condition.
    #[serde(default)]
    pub condition: RetryCondition,
}

/// Backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub strategy: BackoffStrategyConfig,
    /// Fixed delay, or the first delay of an exponential backoff.
    #[serde(default)]
    pub base_secs: u64,
    /// Growth factor for exponential backoff.
    pub multiplier: Option<f64>,
    /// Cap for exponential backoff.
    pub max_delay_secs: Option<u64>,
    /// Spread exponential delays by ±15%.
    #[serde(default)]
    pub jitter: bool,
}

/// Backoff strategy names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategyConfig {
    None,
    Fixed,
    Exponential,
}
