//! Configuration defaults and loading for the recovery pipeline.
//!
//! Defaults live in [`defaults`], environment variable names in [`env_vars`].
//! [`RecoveryConfig::from_env`] overlays the environment on the defaults and
//! [`RecoveryConfig::from_json_file`] reads a JSON file where missing fields
//! fall back to the defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default values.
pub mod defaults {
    /// Maximum number of records kept in the error queue.
    pub const QUEUE_CAPACITY: usize = 1000;
    /// First backoff step in seconds.
    pub const BASE_BACKOFF_SECS: u64 = 5;
    /// Backoff ceiling in seconds.
    pub const MAX_BACKOFF_SECS: u64 = 300;
    /// Consecutive in-process recovery failures before a device escalates.
    pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
    /// Interval between unrecoverable-error sweeps.
    pub const SWEEP_INTERVAL_SECS: u64 = 3600;
    /// Number of recent records re-scanned per sweep.
    pub const SWEEP_BATCH_SIZE: usize = 100;
    /// Minimum time between two notifications for the same device and code.
    pub const NOTIFICATION_COOLDOWN_SECS: u64 = 4 * 3600;
    /// Longest accepted notification cooldown (one year).
    pub const MAX_NOTIFICATION_COOLDOWN_SECS: u64 = 365 * 24 * 3600;
}

/// Environment variable names.
pub mod env_vars {
    pub const QUEUE_CAPACITY: &str = "SPROUT_ERROR_QUEUE_CAPACITY";
    pub const BASE_BACKOFF_SECS: &str = "SPROUT_BASE_BACKOFF_SECS";
    pub const MAX_BACKOFF_SECS: &str = "SPROUT_MAX_BACKOFF_SECS";
    pub const MAX_CONSECUTIVE_FAILURES: &str = "SPROUT_MAX_RECOVERY_FAILURES";
    pub const SWEEP_INTERVAL_SECS: &str = "SPROUT_SWEEP_INTERVAL_SECS";
    pub const SWEEP_BATCH_SIZE: &str = "SPROUT_SWEEP_BATCH_SIZE";
    pub const NOTIFICATION_COOLDOWN_SECS: &str = "SPROUT_NOTIFICATION_COOLDOWN_SECS";
    /// Emit JSON logs (read by the binary).
    pub const LOG_JSON: &str = "SPROUT_LOG_JSON";
}

/// Error monitor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Bounded queue capacity; the oldest record is evicted past it.
    pub queue_capacity: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: defaults::QUEUE_CAPACITY,
        }
    }
}

/// Device self-healing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfHealingConfig {
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub max_consecutive_failures: u32,
}

impl Default for SelfHealingConfig {
    fn default() -> Self {
        Self {
            base_backoff_secs: defaults::BASE_BACKOFF_SECS,
            max_backoff_secs: defaults::MAX_BACKOFF_SECS,
            max_consecutive_failures: defaults::MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl SelfHealingConfig {
    /// Backoff for the given number of previous attempts.
    pub fn backoff(&self, attempt_count: u32) -> chrono::Duration {
        crate::recovery::backoff_for(attempt_count, self.base_backoff_secs, self.max_backoff_secs)
    }
}

/// Unrecoverable error handler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnrecoverableConfig {
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: usize,
    pub notification_cooldown_secs: u64,
}

impl Default for UnrecoverableConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: defaults::SWEEP_INTERVAL_SECS,
            sweep_batch_size: defaults::SWEEP_BATCH_SIZE,
            notification_cooldown_secs: defaults::NOTIFICATION_COOLDOWN_SECS,
        }
    }
}

impl UnrecoverableConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Notification cooldown, capped at
    /// [`MAX_NOTIFICATION_COOLDOWN_SECS`](defaults::MAX_NOTIFICATION_COOLDOWN_SECS).
    pub fn cooldown(&self) -> chrono::Duration {
        let secs = self
            .notification_cooldown_secs
            .min(defaults::MAX_NOTIFICATION_COOLDOWN_SECS);
        chrono::Duration::seconds(secs as i64)
    }
}

/// Complete recovery pipeline configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub monitor: MonitorConfig,
    pub self_healing: SelfHealingConfig,
    pub unrecoverable: UnrecoverableConfig,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl RecoveryConfig {
    /// Defaults overlaid with any `SPROUT_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Overlay environment variables on this configuration.
    pub fn with_env_overrides(self) -> Self {
        let Self {
            monitor,
            self_healing,
            unrecoverable,
        } = self;

        Self {
            monitor: MonitorConfig {
                queue_capacity: env_or(env_vars::QUEUE_CAPACITY, monitor.queue_capacity),
            },
            self_healing: SelfHealingConfig {
                base_backoff_secs: env_or(
                    env_vars::BASE_BACKOFF_SECS,
                    self_healing.base_backoff_secs,
                ),
                max_backoff_secs: env_or(env_vars::MAX_BACKOFF_SECS, self_healing.max_backoff_secs),
                max_consecutive_failures: env_or(
                    env_vars::MAX_CONSECUTIVE_FAILURES,
                    self_healing.max_consecutive_failures,
                ),
            },
            unrecoverable: UnrecoverableConfig {
                sweep_interval_secs: env_or(
                    env_vars::SWEEP_INTERVAL_SECS,
                    unrecoverable.sweep_interval_secs,
                ),
                sweep_batch_size: env_or(
                    env_vars::SWEEP_BATCH_SIZE,
                    unrecoverable.sweep_batch_size,
                ),
                notification_cooldown_secs: env_or(
                    env_vars::NOTIFICATION_COOLDOWN_SECS,
                    unrecoverable.notification_cooldown_secs,
                ),
            },
        }
    }

    /// Load from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.monitor.queue_capacity == 0 {
            return Err(Error::InvalidConfiguration(
                "monitor.queue_capacity must be greater than 0".to_string(),
            ));
        }
        if self.self_healing.base_backoff_secs == 0 {
            return Err(Error::InvalidConfiguration(
                "self_healing.base_backoff_secs must be greater than 0".to_string(),
            ));
        }
        if self.self_healing.max_backoff_secs < self.self_healing.base_backoff_secs {
            return Err(Error::InvalidConfiguration(format!(
                "self_healing.max_backoff_secs ({}) is below base_backoff_secs ({})",
                self.self_healing.max_backoff_secs, self.self_healing.base_backoff_secs
            )));
        }
        if self.unrecoverable.sweep_interval_secs == 0 {
            return Err(Error::InvalidConfiguration(
                "unrecoverable.sweep_interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.unrecoverable.notification_cooldown_secs > defaults::MAX_NOTIFICATION_COOLDOWN_SECS {
            return Err(Error::InvalidConfiguration(format!(
                "unrecoverable.notification_cooldown_secs ({}) exceeds {}",
                self.unrecoverable.notification_cooldown_secs,
                defaults::MAX_NOTIFICATION_COOLDOWN_SECS
            )));
        }
        Ok(())
    }
}
