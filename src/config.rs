//! Configuration for the `requeue` binary.
//!
//! Loaded from a TOML file with every field optional:
//!
//! ```toml
//! [controller]
//! name = "pinger"
//! workers = 4
//!
//! [controller.rate_limiter]
//! base_delay_ms = 5
//! max_delay_secs = 1000
//! qps = 10.0
//! burst = 100
//!
//! [demo]
//! entities = 20
//! failure_rate = 0.2
//! ```

use std::path::Path;

use requeue_core::{Error, Result};
use requeue_reconciler::ControllerConfig;
use serde::{Deserialize, Serialize};

/// Everything the binary can be configured with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_controller")]
    pub controller: ControllerConfig,

    #[serde(default)]
    pub demo: DemoConfig,
}

fn default_controller() -> ControllerConfig {
    ControllerConfig::named("pinger")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            controller: default_controller(),
            demo: DemoConfig::default(),
        }
    }
}

impl AppConfig {
    /// Read and validate a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// result fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config_load_failed(path, e.to_string()))?;
        let config: Self =
            toml::from_str(&text).map_err(|e| Error::config_load_failed(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, otherwise use the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a given file cannot be loaded.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any section is invalid.
    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        self.demo.validate()
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::invalid_config(e.to_string()))
    }
}

/// Shape of the demo workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Entities created at start.
    #[serde(default = "default_entities")]
    pub entities: usize,

    /// Entities created with an empty target, which fail terminally.
    #[serde(default = "default_invalid")]
    pub invalid: usize,

    /// Chance that any one reconcile fails transiently, in `[0, 1]`.
    #[serde(default = "default_failure_rate")]
    pub failure_rate: f64,

    /// How often each healthy entity is pinged again.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// How long to let the controller run before deleting entities.
    #[serde(default = "default_duration_secs")]
    pub duration_secs: u64,

    /// Share of entities deleted at the end, in `[0, 1]`.
    #[serde(default = "default_delete_fraction")]
    pub delete_fraction: f64,
}

const fn default_entities() -> usize {
    20
}

const fn default_invalid() -> usize {
    1
}

const fn default_failure_rate() -> f64 {
    0.2
}

const fn default_ping_interval_ms() -> u64 {
    500
}

const fn default_duration_secs() -> u64 {
    5
}

const fn default_delete_fraction() -> f64 {
    0.5
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            entities: default_entities(),
            invalid: default_invalid(),
            failure_rate: default_failure_rate(),
            ping_interval_ms: default_ping_interval_ms(),
            duration_secs: default_duration_secs(),
            delete_fraction: default_delete_fraction(),
        }
    }
}

impl DemoConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a rate lies outside `[0, 1]` or the ping interval
    /// is zero.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(Error::invalid_config(format!(
                "failure_rate must be within [0, 1], got {}",
                self.failure_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.delete_fraction) {
            return Err(Error::invalid_config(format!(
                "delete_fraction must be within [0, 1], got {}",
                self.delete_fraction
            )));
        }
        if self.ping_interval_ms == 0 {
            return Err(Error::invalid_config("ping_interval_ms must be greater than 0"));
        }
        Ok(())
    }
}
