//! Engine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::{ScheduleMode, SchedulerSettings};
use crate::store::DEFAULT_HISTORY_LIMIT;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("lease_duration_secs ({lease}) must be shorter than check_interval_secs ({interval})")]
    LeaseTooLong { lease: u64, interval: u64 },
}

/// Tunables shared by the scheduler and processor.
///
/// Durations are whole seconds so the JSON form stays readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub check_interval_secs: u64,
    pub lock_name: String,
    /// Should be shorter than the interval so a crashed holder frees the
    /// next cycle.
    pub lease_duration_secs: u64,
    pub handler_timeout_secs: u64,
    pub lock_timeout_secs: u64,
    pub schedule: ScheduleMode,
    pub propagate_to_dependents: bool,
    pub history_limit: usize,
    pub max_repeated_actions: u32,
    pub telemetry_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            lock_name: "keel:check-cycle".to_string(),
            lease_duration_secs: 55,
            handler_timeout_secs: 30,
            lock_timeout_secs: 5,
            schedule: ScheduleMode::All,
            propagate_to_dependents: false,
            history_limit: DEFAULT_HISTORY_LIMIT,
            max_repeated_actions: 3,
            telemetry_capacity: 1024,
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("check_interval_secs", self.check_interval_secs),
            ("lease_duration_secs", self.lease_duration_secs),
            ("handler_timeout_secs", self.handler_timeout_secs),
            ("lock_timeout_secs", self.lock_timeout_secs),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        if self.history_limit == 0 {
            return Err(ConfigError::Zero("history_limit"));
        }
        // a cycle's enqueueing is bounded by its lease
        if self.lease_duration_secs >= self.check_interval_secs {
            return Err(ConfigError::LeaseTooLong {
                lease: self.lease_duration_secs,
                interval: self.check_interval_secs,
            });
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            check_interval: self.check_interval(),
            lock_name: self.lock_name.clone(),
            lease_duration: self.lease_duration(),
            lock_timeout: self.lock_timeout(),
            mode: self.schedule,
        }
    }
}
