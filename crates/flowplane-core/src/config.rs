//! flowplane.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlPlaneConfig {
    pub server: ServerConfig,
    pub scheduler: SchedulerConfig,
    pub queue: QueueConfig,
    pub capacity: CapacityConfig,
    pub dispatcher: DispatcherConfig,
    pub tracker: TrackerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "serde_str")]
    pub loop_interval: Duration,
    /// Scheduled runs are created up to `now + horizon`.
    #[serde(with = "serde_str")]
    pub horizon: Duration,
    /// Upper bound on runs created per schedule per tick.
    pub max_scheduled_runs: usize,
    /// Occurrences missed by more than this (daemon downtime) are skipped
    /// instead of backfilled. Never shorter than `loop_interval`.
    #[serde(with = "serde_str")]
    pub misfire_grace: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Pending requests older than this are promoted ahead of queue priority.
    #[serde(with = "serde_str")]
    pub starvation_threshold: Duration,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CapacityConfig {
    /// Account-wide ceiling on active runs across every pool. 0 = unlimited.
    pub global_concurrency_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    #[serde(with = "serde_str")]
    pub loop_interval: Duration,
    pub submission_retries: u32,
    #[serde(with = "serde_str")]
    pub retry_backoff: Duration,
    #[serde(with = "serde_str")]
    pub max_retry_backoff: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    #[serde(with = "serde_str")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "serde_str")]
    pub late_after: Duration,
    #[serde(with = "serde_str")]
    pub cancellation_grace: Duration,
    #[serde(with = "serde_str")]
    pub poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 4200,
            data_dir: PathBuf::from("/var/lib/flowplane"),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_secs(10),
            horizon: Duration::from_secs(3600),
            max_scheduled_runs: 10,
            misfire_grace: Duration::from_secs(900),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            starvation_threshold: Duration::from_secs(300),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            loop_interval: Duration::from_secs(2),
            submission_retries: 3,
            retry_backoff: Duration::from_secs(1),
            max_retry_backoff: Duration::from_secs(30),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(90),
            late_after: Duration::from_secs(15),
            cancellation_grace: Duration::from_secs(60),
            poll_interval: Duration::from_secs(10),
        }
    }
}

impl CapacityConfig {
    /// The global ceiling, or `None` when unlimited.
    pub fn global_limit(&self) -> Option<u32> {
        (self.global_concurrency_limit > 0).then_some(self.global_concurrency_limit)
    }
}

impl ControlPlaneConfig {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> CoreResult<Self> {
        let config: ControlPlaneConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CoreResult<String> {
        toml::to_string_pretty(self).map_err(|e| CoreError::InvalidValue {
            field: "config",
            reason: e.to_string(),
        })
    }

    /// Reject values that would stall the control loops.
    pub fn validate(&self) -> CoreResult<()> {
        let non_zero = [
            ("scheduler.loop_interval", self.scheduler.loop_interval),
            ("dispatcher.loop_interval", self.dispatcher.loop_interval),
            ("tracker.heartbeat_timeout", self.tracker.heartbeat_timeout),
            ("tracker.poll_interval", self.tracker.poll_interval),
        ];
        for (field, value) in non_zero {
            if value.is_zero() {
                return Err(CoreError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.dispatcher.retry_backoff > self.dispatcher.max_retry_backoff {
            return Err(CoreError::InvalidValue {
                field: "dispatcher.retry_backoff",
                reason: "exceeds dispatcher.max_retry_backoff".to_string(),
            });
        }
        Ok(())
    }
}
