//! # Configuration
//!
//! Layered configuration: built-in defaults, then an optional file, then
//! `MES_`-prefixed environment variables (`__` separates nested keys, e.g.
//! `MES_RETRY__AUTO_RETRY=false`).

use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::constants::{defaults, ENV_PREFIX, ENV_SEPARATOR};
use crate::error::{MesError, MesResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MesConfig {
    pub environment: String,
    pub scheduler: SchedulerConfig,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub allocation: AllocationConfig,
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval of the background pass that sweeps timeouts and re-evaluates
    /// blocked orders.
    pub sweep_interval_ms: u64,
    /// How long [`Orchestrator::run_until_settled`](crate::orchestration::Orchestrator::run_until_settled)
    /// waits for the next outcome before declaring an order idle.
    pub idle_wait_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Applied when a step declares no timeout. Zero keeps such steps unlimited.
    pub default_step_timeout_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub auto_retry: bool,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    pub lock_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Capacity of the executor outcome channel and the audit broadcast.
    pub channel_capacity: usize,
}

impl Default for MesConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            scheduler: SchedulerConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            allocation: AllocationConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: defaults::SWEEP_INTERVAL_MS,
            idle_wait_ms: defaults::IDLE_WAIT_MS,
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_seconds: 0,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            auto_retry: true,
            backoff_base_ms: 0,
            backoff_multiplier: 2.0,
            backoff_max_ms: defaults::BACKOFF_MAX_MS,
        }
    }
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: defaults::LOCK_TIMEOUT_MS,
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: defaults::EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl MesConfig {
    /// Load configuration from defaults, an optional file and the environment.
    pub fn load(path: Option<&str>) -> MesResult<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&MesConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        let config: MesConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MesResult<()> {
        if self.scheduler.sweep_interval_ms == 0 {
            return Err(MesError::Configuration(
                "scheduler.sweep_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.allocation.lock_timeout_ms == 0 {
            return Err(MesError::Configuration(
                "allocation.lock_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(MesError::Configuration(
                "events.channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(MesError::Configuration(format!(
                "retry.backoff_multiplier must be at least 1.0, got {}",
                self.retry.backoff_multiplier
            )));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.sweep_interval_ms)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.scheduler.idle_wait_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.allocation.lock_timeout_ms)
    }
}

impl RetryConfig {
    /// Delay before the attempt following `retry_count` prior retries.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        if self.backoff_base_ms == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(retry_count).unwrap_or(i32::MAX);
        let delay = (self.backoff_base_ms as f64) * self.backoff_multiplier.powi(exponent);
        let capped = delay.min(self.backoff_max_ms as f64);
        Duration::from_millis(capped as u64)
    }
}
