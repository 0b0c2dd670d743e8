//! Retry delay policies.
//!
//! A [`RateLimiter`] decides how long a key must wait before it is handed
//! to a worker again after a failure. The controller default combines a
//! per-key exponential backoff with a global token bucket and waits for
//! whichever is slower.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use moka::sync::Cache;
use requeue_core::{Error, Result};
use serde::{Deserialize, Serialize};

use crate::queue::QueueKey;

/// Computes re-dispatch delays for failing keys.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `key` may be processed again. Counts as one failure.
    fn when(&self, key: &K) -> Duration;

    /// Drop all backoff state for `key`. Callers invoke this after success.
    fn forget(&self, key: &K);

    /// Failures recorded for `key` since it was last forgotten.
    fn num_requeues(&self, key: &K) -> u32;
}

/// Per-key backoff state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffRecord {
    pub failures: u32,
    pub last_delay: Duration,
}

/// `base * 2^failures`, capped at `max`.
#[must_use]
pub fn exponential_delay(base: Duration, max: Duration, failures: u32) -> Duration {
    2u32.checked_pow(failures)
        .and_then(|factor| base.checked_mul(factor))
        .map_or(max, |delay| delay.min(max))
}

/// Per-key exponential backoff.
///
/// The first failure of a key waits `base`, each following failure doubles
/// the wait up to `max`. Records of keys that see no activity for the idle
/// timeout are evicted so the map does not grow with entity churn.
pub struct ExponentialFailureRateLimiter<K: QueueKey> {
    base: Duration,
    max: Duration,
    records: Cache<K, BackoffRecord>,
}

impl<K: QueueKey> ExponentialFailureRateLimiter<K> {
    /// Create a limiter evicting idle records after `idle_eviction`.
    ///
    /// Delays only grow until [`RateLimiter::forget`] if `idle_eviction`
    /// is longer than `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration, idle_eviction: Duration) -> Self {
        Self {
            base,
            max,
            records: Cache::builder().time_to_idle(idle_eviction).build(),
        }
    }

    /// Current backoff record for `key`, if any.
    #[must_use]
    pub fn record(&self, key: &K) -> Option<BackoffRecord> {
        self.records.get(key)
    }
}

impl<K: QueueKey> RateLimiter<K> for ExponentialFailureRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let (base, max) = (self.base, self.max);
        self.records
            .entry(key.clone())
            .and_upsert_with(|existing| {
                let failures = existing.map_or(0, |entry| entry.into_value().failures);
                BackoffRecord {
                    failures: failures.saturating_add(1),
                    last_delay: exponential_delay(base, max, failures),
                }
            })
            .into_value()
            .last_delay
    }

    fn forget(&self, key: &K) {
        self.records.invalidate(key);
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.records.get(key).map_or(0, |record| record.failures)
    }
}

/// Global token bucket shared by every key.
///
/// Admits bursts of up to `burst` retries, then one retry per `1 / qps`
/// seconds. Implemented as a generic cell rate algorithm over one atomic
/// "theoretical arrival time", so reservations never take a lock.
pub struct BucketRateLimiter<K> {
    origin: Instant,
    interval_nanos: u64,
    burst_nanos: u64,
    tat: AtomicU64,
    _key: PhantomData<fn(&K)>,
}

impl<K> BucketRateLimiter<K> {
    /// Create a bucket refilled at `qps` tokens per second holding `burst`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `qps` is not a positive finite
    /// number or `burst` is zero.
    pub fn new(qps: f64, burst: u32) -> Result<Self> {
        if !qps.is_finite() || qps <= 0.0 {
            return Err(Error::invalid_config(format!(
                "bucket qps must be positive, got {qps}"
            )));
        }
        if burst == 0 {
            return Err(Error::invalid_config("bucket burst must be positive"));
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let interval_nanos = ((1e9 / qps).round() as u64).max(1);

        Ok(Self {
            origin: Instant::now(),
            interval_nanos,
            burst_nanos: interval_nanos.saturating_mul(u64::from(burst)),
            tat: AtomicU64::new(0),
            _key: PhantomData,
        })
    }

    /// Reserve one token at `now` (nanoseconds since creation) and return
    /// how long the caller must wait for it.
    fn reserve_at(&self, now: u64) -> Duration {
        let mut current = self.tat.load(Ordering::Acquire);
        loop {
            let next = current.max(now).saturating_add(self.interval_nanos);
            match self
                .tat
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let allowed_at = next.saturating_sub(self.burst_nanos);
                    return Duration::from_nanos(allowed_at.saturating_sub(now));
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn now(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter<K> {
    fn when(&self, _key: &K) -> Duration {
        self.reserve_at(self.now())
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 {
        0
    }
}

/// Waits for the slowest of several limiters.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Arc<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    #[must_use]
    pub fn new(limiters: Vec<Arc<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or_default()
    }

    fn forget(&self, key: &K) {
        self.limiters.iter().for_each(|limiter| limiter.forget(key));
    }

    fn num_requeues(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Settings for [`default_controller_rate_limiter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Delay after a key's first failure, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on a key's backoff, in seconds.
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Global retry refill rate.
    #[serde(default = "default_qps")]
    pub qps: f64,

    /// Global retry burst capacity.
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Drop a key's backoff record after this long without activity.
    /// Defaults to twice the maximum delay and must exceed it, or a key
    /// still waiting out its backoff would start over from the base delay.
    #[serde(default)]
    pub idle_eviction_secs: Option<u64>,
}

const fn default_base_delay_ms() -> u64 {
    5
}

const fn default_max_delay_secs() -> u64 {
    1000
}

const fn default_qps() -> f64 {
    10.0
}

const fn default_burst() -> u32 {
    100
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            qps: default_qps(),
            burst: default_burst(),
            idle_eviction_secs: None,
        }
    }
}

impl RateLimiterConfig {
    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    #[must_use]
    pub const fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    #[must_use]
    pub fn idle_eviction(&self) -> Duration {
        self.idle_eviction_secs.map_or_else(
            || self.max_delay().saturating_mul(2),
            Duration::from_secs,
        )
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(Error::invalid_config("base_delay_ms must be greater than 0"));
        }
        if self.max_delay() < self.base_delay() {
            return Err(Error::invalid_config(
                "max_delay_secs must not be smaller than base_delay_ms",
            ));
        }
        if !self.qps.is_finite() || self.qps <= 0.0 {
            return Err(Error::invalid_config("qps must be greater than 0"));
        }
        if self.burst == 0 {
            return Err(Error::invalid_config("burst must be greater than 0"));
        }
        if self.idle_eviction() <= self.max_delay() {
            return Err(Error::invalid_config(format!(
                "idle_eviction_secs ({}s) must exceed max_delay_secs ({}s)",
                self.idle_eviction().as_secs(),
                self.max_delay_secs
            )));
        }
        Ok(())
    }
}

/// Per-key exponential backoff combined with a global token bucket.
///
/// # Errors
///
/// Returns [`Error::InvalidConfig`] if the configuration does not validate.
pub fn default_controller_rate_limiter<K: QueueKey>(
    config: &RateLimiterConfig,
) -> Result<MaxOfRateLimiter<K>> {
    config.validate()?;
    let per_key: Arc<dyn RateLimiter<K>> = Arc::new(ExponentialFailureRateLimiter::new(
        config.base_delay(),
        config.max_delay(),
        config.idle_eviction(),
    ));
    let bucket: Arc<dyn RateLimiter<K>> = Arc::new(BucketRateLimiter::new(config.qps, config.burst)?);
    Ok(MaxOfRateLimiter::new(vec![per_key, bucket]))
}
