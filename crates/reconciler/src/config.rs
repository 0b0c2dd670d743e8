//! Controller configuration.

use std::time::Duration;

use requeue_core::{Error, Result};
use requeue_workqueue::RateLimiterConfig;
use serde::{Deserialize, Serialize};

use crate::retry::DEFAULT_CONFLICT_RETRIES;

/// Settings for one [`crate::Controller`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Name used in logs and error reports.
    #[serde(default = "default_name")]
    pub name: String,

    /// Concurrent reconcile workers. Distinct keys run in parallel; one key
    /// never does.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Attempts for writes that hit a version conflict.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,

    /// Re-enqueue every stored key at this interval. Off when unset.
    #[serde(default)]
    pub resync_secs: Option<u64>,

    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
}

fn default_name() -> String {
    "controller".to_string()
}

const fn default_workers() -> usize {
    2
}

const fn default_conflict_retries() -> u32 {
    DEFAULT_CONFLICT_RETRIES
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            workers: default_workers(),
            conflict_retries: default_conflict_retries(),
            resync_secs: None,
            rate_limiter: RateLimiterConfig::default(),
        }
    }
}

impl ControllerConfig {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn resync_period(&self) -> Option<Duration> {
        self.resync_secs.map(Duration::from_secs)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is empty, there are no workers, no
    /// write attempts, a zero resync period, or the rate limiter settings
    /// are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::invalid_config("controller name must not be empty"));
        }
        if self.workers == 0 {
            return Err(Error::invalid_config("workers must be at least 1"));
        }
        if self.conflict_retries == 0 {
            return Err(Error::invalid_config("conflict_retries must be at least 1"));
        }
        if self.resync_secs == Some(0) {
            return Err(Error::invalid_config("resync_secs must be positive when set"));
        }
        self.rate_limiter.validate()
    }
}
