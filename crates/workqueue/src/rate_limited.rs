//! Work queue with rate-limited re-adds.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::delaying::DelayingQueue;
use crate::queue::QueueKey;
use crate::rate_limiter::RateLimiter;

/// The queue a controller's workers share.
///
/// Combines the deduplicating [`crate::WorkQueue`], delayed adds, and a
/// [`RateLimiter`] deciding how long failing keys wait before retrying.
pub struct RateLimitingQueue<K> {
    delaying: DelayingQueue<K>,
    limiter: Arc<dyn RateLimiter<K>>,
}

impl<K> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            delaying: self.delaying.clone(),
            limiter: Arc::clone(&self.limiter),
        }
    }
}

impl<K: QueueKey> RateLimitingQueue<K> {
    /// Create a queue using `limiter` for failure backoff.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new(limiter: Arc<dyn RateLimiter<K>>) -> Self {
        Self {
            delaying: DelayingQueue::new(),
            limiter,
        }
    }

    pub async fn add(&self, key: K) {
        self.delaying.queue().add(key).await;
    }

    /// Wait for the next key; `None` once shut down and drained.
    pub async fn get(&self) -> Option<K> {
        self.delaying.queue().get().await
    }

    pub async fn done(&self, key: &K) {
        self.delaying.queue().done(key).await;
    }

    pub async fn len(&self) -> usize {
        self.delaying.queue().len().await
    }

    pub async fn is_empty(&self) -> bool {
        self.delaying.queue().is_empty().await
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.delaying.queue().is_shutting_down().await
    }

    pub async fn shut_down(&self) {
        self.delaying.shut_down().await;
    }

    pub async fn shut_down_with_drain(&self) {
        self.delaying.shut_down_with_drain().await;
    }

    /// Add `key` after `delay` without touching its failure count.
    pub async fn add_after(&self, key: K, delay: Duration) {
        self.delaying.add_after(key, delay).await;
    }

    /// Record a failure for `key` and add it back once the limiter allows.
    ///
    /// Returns the delay chosen by the limiter.
    pub async fn add_rate_limited(&self, key: K) -> Duration {
        let delay = self.limiter.when(&key);
        debug!(key = ?key, delay_ms = delay.as_millis(), "Rate limited requeue");
        self.delaying.add_after(key, delay).await;
        delay
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Failures recorded for `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.limiter.num_requeues(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::ExponentialFailureRateLimiter;

    fn queue() -> RateLimitingQueue<&'static str> {
        RateLimitingQueue::new(Arc::new(ExponentialFailureRateLimiter::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            Duration::from_secs(3600),
        )))
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_rate_limited_backs_off() {
        let queue = queue();
        assert_eq!(queue.add_rate_limited("k").await, Duration::from_millis(100));
        assert_eq!(queue.num_requeues(&"k"), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.get().await, Some("k"));
        queue.done(&"k").await;

        assert_eq!(queue.add_rate_limited("k").await, Duration::from_millis(200));
        assert_eq!(queue.num_requeues(&"k"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_does_not_count_as_failure() {
        let queue = queue();
        queue.add_after("k", Duration::from_secs(1)).await;
        assert_eq!(queue.num_requeues(&"k"), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_forget_resets_backoff() {
        let queue = queue();
        queue.add_rate_limited("k").await;
        queue.add_rate_limited("k").await;
        queue.forget(&"k");
        assert_eq!(queue.num_requeues(&"k"), 0);
        assert_eq!(queue.add_rate_limited("k").await, Duration::from_millis(100));
    }
}
