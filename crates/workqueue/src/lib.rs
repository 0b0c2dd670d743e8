//! Deduplicating work queue for level-based controllers.
//!
//! Change notifications are reduced to keys. A key is queued at most once
//! no matter how many notifications arrive for it, is handed to at most one
//! worker at a time, and is re-queued after its worker finishes if it was
//! touched again in the meantime.
//!
//! # Layers
//!
//! - [`KeySet`] - the dirty/processing/queue bookkeeping
//! - [`WorkQueue`] - blocking `get`, `add`, `done`, `shut_down`
//! - [`DelayingQueue`] - `add_after` for scheduled requeues
//! - [`RateLimitingQueue`] - `add_rate_limited` / `forget` driven by a
//!   [`RateLimiter`]
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use requeue_workqueue::{default_controller_rate_limiter, RateLimiterConfig, RateLimitingQueue};
//!
//! let limiter = default_controller_rate_limiter::<String>(&RateLimiterConfig::default())?;
//! let queue = RateLimitingQueue::new(Arc::new(limiter));
//! queue.add("ns/x".to_string()).await;
//! while let Some(key) = queue.get().await {
//!     // reconcile key ...
//!     queue.forget(&key);
//!     queue.done(&key).await;
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod delaying;
pub mod keyset;
pub mod queue;
pub mod rate_limited;
pub mod rate_limiter;

pub use delaying::DelayingQueue;
pub use keyset::KeySet;
pub use queue::{QueueKey, WorkQueue};
pub use rate_limited::RateLimitingQueue;
pub use rate_limiter::{
    BackoffRecord, BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter,
    RateLimiter, RateLimiterConfig, default_controller_rate_limiter, exponential_delay,
};
