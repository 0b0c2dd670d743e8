//! Feeds store change notifications into the work queue as keys.

use std::sync::Arc;
use std::time::Duration;

use requeue_core::ObjectKey;
use requeue_workqueue::RateLimitingQueue;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

use crate::error::StoreResult;
use crate::store::{EntityStore, Payload, StoreEvent};

/// Adds the key of every stored entity to `queue`.
///
/// Returns the number of keys enqueued.
///
/// # Errors
///
/// Returns the store's error if listing fails.
pub async fn enqueue_all<S, T, St>(store: &St, queue: &RateLimitingQueue<ObjectKey>) -> StoreResult<usize>
where
    S: Payload,
    T: Payload,
    St: EntityStore<S, T> + ?Sized,
{
    let objects = store.list().await?;
    let count = objects.len();
    for object in objects {
        queue.add(object.key()).await;
    }
    Ok(count)
}

/// Watches a store and turns each change into a queue add.
///
/// The event payload is ignored beyond its key: the reconciler re-reads
/// current state, so any number of events for one key collapse into a
/// single pending reconcile.
pub struct KeySource<S, T> {
    store: Arc<dyn EntityStore<S, T>>,
    queue: RateLimitingQueue<ObjectKey>,
    resync: Option<Duration>,
}

impl<S: Payload, T: Payload> KeySource<S, T> {
    pub fn new(store: Arc<dyn EntityStore<S, T>>, queue: RateLimitingQueue<ObjectKey>) -> Self {
        Self {
            store,
            queue,
            resync: None,
        }
    }

    /// Also re-enqueue every key each `period`.
    #[must_use]
    pub const fn with_resync(mut self, period: Option<Duration>) -> Self {
        self.resync = period;
        self
    }

    /// Subscribe, enqueue every existing key, then forward changes until
    /// the queue shuts down or the store's channel closes.
    ///
    /// The subscription is taken before this returns, so no change made
    /// after the call can be missed.
    pub fn spawn(self) -> JoinHandle<()> {
        let events = self.store.subscribe();
        tokio::spawn(self.run(events))
    }

    async fn run(self, mut events: broadcast::Receiver<StoreEvent>) {
        self.resync_all("initial").await;

        let mut resync = self.resync.and_then(|period| {
            let Some(first) = Instant::now().checked_add(period) else {
                warn!(?period, "Resync period out of range; periodic resync disabled");
                return None;
            };
            let mut ticker = interval_at(first, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(ticker)
        });

        loop {
            let tick = async {
                match resync.as_mut() {
                    Some(ticker) => {
                        ticker.tick().await;
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        debug!(key = %event.key, kind = ?event.kind, "Change observed");
                        self.queue.add(event.key).await;
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Change notifications dropped; re-listing");
                        self.resync_all("lagged").await;
                    }
                    Err(RecvError::Closed) => {
                        info!("Store closed its change channel");
                        return;
                    }
                },
                () = tick => self.resync_all("periodic").await,
            }

            if self.queue.is_shutting_down().await {
                debug!("Queue shut down; key source stopping");
                return;
            }
        }
    }

    async fn resync_all(&self, reason: &'static str) {
        match enqueue_all(self.store.as_ref(), &self.queue).await {
            Ok(count) => debug!(count, reason, "Enqueued all keys"),
            Err(err) => warn!(error = %err, reason, "Listing the store failed"),
        }
    }
}
