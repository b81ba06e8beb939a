//! Configuration for the scheduler and its hosts.
//!
//! Loaded from TOML. Every section and field has a default, so an empty
//! file (or no file at all) yields the stock scheduler:
//!
//! ```toml
//! [scheduler]
//! quiescence_delay_ms = 300
//! max_idle_period_ms = 50
//!
//! [load_tracking]
//! enabled = true
//! reporting_interval_ms = 1000
//! max_samples = 64
//!
//! [throttling]
//! enabled = false
//! max_budget_ms = 1000      # negative: no cap
//! recovery_rate = 0.01
//! max_delay_ms = 60000      # negative: no bound
//!
//! [logging]
//! level = "info"
//! format = "pretty"
//! ```

use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for machine consumption
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Idle-period tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Quiet time required after the last immediate task before a long idle
    /// period may start.
    pub quiescence_delay_ms: u64,
    /// Upper bound on the length of a long idle period.
    pub max_idle_period_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            quiescence_delay_ms: 300,
            max_idle_period_ms: 50,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub fn quiescence_delay(&self) -> Duration {
        Duration::from_millis(self.quiescence_delay_ms)
    }

    #[must_use]
    pub fn max_idle_period(&self) -> Duration {
        Duration::from_millis(self.max_idle_period_ms)
    }
}

/// Thread load reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadTrackingConfig {
    pub enabled: bool,
    /// Length of one load sample window.
    pub reporting_interval_ms: u64,
    /// Number of recent samples kept for snapshots.
    pub max_samples: usize,
}

impl Default for LoadTrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reporting_interval_ms: 1000,
            max_samples: 64,
        }
    }
}

impl LoadTrackingConfig {
    #[must_use]
    pub fn reporting_interval(&self) -> Duration {
        Duration::from_millis(self.reporting_interval_ms)
    }
}

/// CPU-time budget throttling, applied while the lifecycle state is
/// `throttled`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottlingConfig {
    pub enabled: bool,
    /// Budget cap. Negative disables the cap.
    pub max_budget_ms: i64,
    /// Budget regained per second of wall time.
    pub recovery_rate: f64,
    /// Longest a task may be held back. Negative disables the bound.
    pub max_delay_ms: i64,
}

impl Default for ThrottlingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_budget_ms: 1000,
            recovery_rate: 0.01,
            max_delay_ms: 60_000,
        }
    }
}

impl ThrottlingConfig {
    #[must_use]
    pub fn max_budget_level(&self) -> Option<Duration> {
        u64::try_from(self.max_budget_ms).ok().map(Duration::from_millis)
    }

    #[must_use]
    pub fn max_throttling_delay(&self) -> Option<Duration> {
        u64::try_from(self.max_delay_ms).ok().map(Duration::from_millis)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub scheduler: SchedulerConfig,
    pub load_tracking: LoadTrackingConfig,
    pub throttling: ThrottlingConfig,
    pub logging: LogConfig,
}

impl Config {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                ConfigError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.max_idle_period_ms == 0 {
            return Err(ConfigError::invalid(
                "scheduler.max_idle_period_ms",
                "must be greater than zero",
            ));
        }
        if self.load_tracking.reporting_interval_ms == 0 {
            return Err(ConfigError::invalid(
                "load_tracking.reporting_interval_ms",
                "must be greater than zero",
            ));
        }
        if self.load_tracking.max_samples == 0 {
            return Err(ConfigError::invalid(
                "load_tracking.max_samples",
                "must be greater than zero",
            ));
        }
        let rate = self.throttling.recovery_rate;
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ConfigError::invalid(
                "throttling.recovery_rate",
                format!("must be a positive number, got {rate}"),
            ));
        }
        self.logging
            .filter()
            .map_err(|err| ConfigError::invalid("logging.level", err.to_string()))?;
        Ok(())
    }
}
