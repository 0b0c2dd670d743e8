//! Blocking work queue over a [`KeySet`].

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tracing::{debug, trace};

use crate::keyset::KeySet;

/// Bounds every queue key must satisfy.
pub trait QueueKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Deduplicating FIFO work queue shared by a pool of workers.
///
/// - [`WorkQueue::add`] marks a key dirty and queues it unless it is already
///   dirty or currently being processed.
/// - [`WorkQueue::get`] waits for a key and hands it out exclusively; the
///   same key is never handed to two callers before [`WorkQueue::done`].
/// - [`WorkQueue::done`] releases a key and re-queues it if it was added
///   again while it was being processed.
/// - [`WorkQueue::shut_down`] stops accepting keys; `get` returns `None`
///   once the queue is drained.
///
/// Cloning is cheap; all clones share the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    /// Wakes `get` callers when a key is queued or the queue shuts down.
    available: Notify,
    /// Wakes `shut_down_with_drain` when the last in-flight key is done.
    drained: Notify,
}

struct State<K> {
    keys: KeySet<K>,
    shutting_down: bool,
    drain: bool,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: QueueKey> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create an empty, running queue.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    keys: KeySet::new(),
                    shutting_down: false,
                    drain: false,
                }),
                available: Notify::new(),
                drained: Notify::new(),
            }),
        }
    }

    /// Mark `key` as needing work. Has no effect after shutdown.
    pub async fn add(&self, key: K) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            debug!(key = ?key, "Ignoring add on shut down queue");
            return;
        }
        if state.keys.insert(key) {
            self.inner.available.notify_one();
        }
    }

    /// Wait for the next key.
    ///
    /// Returns `None` once the queue has been shut down and every queued key
    /// has been handed out. The caller must call [`WorkQueue::done`] with the
    /// returned key when it has finished with it.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a shutdown broadcast between
            // the check and the await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock().await;
                if let Some(key) = state.keys.pop() {
                    trace!(key = ?key, queued = state.keys.len(), "Handing out key");
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Release `key` after processing.
    pub async fn done(&self, key: &K) {
        let mut state = self.inner.state.lock().await;
        if state.keys.complete(key) {
            trace!(key = ?key, "Re-queued key dirtied during processing");
            self.inner.available.notify_one();
        }
        if state.drain && state.keys.processing_len() == 0 {
            self.inner.drained.notify_waiters();
        }
    }

    /// Stop accepting keys and wake every waiting `get`.
    pub async fn shut_down(&self) {
        let mut state = self.inner.state.lock().await;
        if !state.shutting_down {
            debug!(queued = state.keys.len(), "Shutting down work queue");
        }
        state.shutting_down = true;
        self.inner.available.notify_waiters();
    }

    /// Shut down, then wait until every key that has been handed out is done.
    ///
    /// Keys still queued keep being handed out to `get` callers; this only
    /// waits for the in-flight set to empty.
    pub async fn shut_down_with_drain(&self) {
        {
            let mut state = self.inner.state.lock().await;
            state.drain = true;
        }
        self.shut_down().await;

        loop {
            let drained = self.inner.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.inner.state.lock().await.keys.processing_len() == 0 {
                debug!("Work queue drained");
                return;
            }

            drained.await;
        }
    }

    /// Number of keys waiting to be handed out. Observability only.
    pub async fn len(&self) -> usize {
        self.inner.state.lock().await.keys.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().await.shutting_down
    }
}
