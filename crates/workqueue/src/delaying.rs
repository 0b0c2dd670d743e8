//! Delayed adds.
//!
//! [`DelayingQueue`] wraps a [`WorkQueue`] with [`DelayingQueue::add_after`].
//! Waiting keys live in a background task that owns a min-heap of ready
//! times; a key that is already waiting keeps the earlier of its two ready
//! times, so repeated requeues of one key never pile up timers.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, trace};

use crate::queue::{QueueKey, WorkQueue};

/// A key to be added once `ready_at` has passed.
struct DelayedAdd<K> {
    key: K,
    ready_at: Instant,
}

/// Heap entry ordered so that the earliest `ready_at` pops first.
struct Waiting<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for Waiting<K> {}

impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Waiting<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Keys waiting for their ready time.
struct WaitingSet<K> {
    heap: BinaryHeap<Waiting<K>>,
    ready_at: HashMap<K, Instant>,
    seq: u64,
}

impl<K: QueueKey> WaitingSet<K> {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            ready_at: HashMap::new(),
            seq: 0,
        }
    }

    fn insert(&mut self, add: DelayedAdd<K>) {
        if let Some(existing) = self.ready_at.get(&add.key) {
            if *existing <= add.ready_at {
                return;
            }
        }
        self.ready_at.insert(add.key.clone(), add.ready_at);
        self.seq = self.seq.wrapping_add(1);
        self.heap.push(Waiting {
            ready_at: add.ready_at,
            seq: self.seq,
            key: add.key,
        });
    }

    /// Remove every key whose ready time is at or before `now`.
    fn pop_ready(&mut self, now: Instant) -> Vec<K> {
        let mut ready = Vec::new();
        while self.heap.peek().is_some_and(|top| top.ready_at <= now) {
            let Some(entry) = self.heap.pop() else { break };
            // Entries superseded by an earlier ready time are stale.
            if self.ready_at.get(&entry.key) == Some(&entry.ready_at) {
                self.ready_at.remove(&entry.key);
                ready.push(entry.key);
            }
        }
        ready
    }

    fn next_ready(&self) -> Option<Instant> {
        self.heap.peek().map(|top| top.ready_at)
    }

    fn len(&self) -> usize {
        self.ready_at.len()
    }
}

/// A [`WorkQueue`] that can also add keys after a delay.
///
/// Must be created inside a Tokio runtime: construction spawns the task
/// that releases waiting keys.
pub struct DelayingQueue<K> {
    queue: WorkQueue<K>,
    delayed_tx: mpsc::UnboundedSender<DelayedAdd<K>>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl<K> Clone for DelayingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            delayed_tx: self.delayed_tx.clone(),
            stop_tx: Arc::clone(&self.stop_tx),
        }
    }
}

impl<K: QueueKey> DelayingQueue<K> {
    /// Create a queue and spawn its delay loop.
    #[must_use]
    pub fn new() -> Self {
        let queue = WorkQueue::new();
        let (delayed_tx, delayed_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        tokio::spawn(run_delay_loop(queue.clone(), delayed_rx, stop_rx));

        Self {
            queue,
            delayed_tx,
            stop_tx: Arc::new(stop_tx),
        }
    }

    /// The underlying work queue.
    #[must_use]
    pub const fn queue(&self) -> &WorkQueue<K> {
        &self.queue
    }

    /// Add `key` once `delay` has elapsed. A zero delay adds immediately.
    ///
    /// Has no effect after shutdown, or if `delay` reaches past the range
    /// of the clock; such a key would never become ready.
    pub async fn add_after(&self, key: K, delay: Duration) {
        if self.queue.is_shutting_down().await {
            return;
        }
        if delay.is_zero() {
            self.queue.add(key).await;
            return;
        }
        let Some(ready_at) = Instant::now().checked_add(delay) else {
            debug!(key = ?key, ?delay, "Delay out of range; dropping delayed add");
            return;
        };
        let add = DelayedAdd { key, ready_at };
        if self.delayed_tx.send(add).is_err() {
            debug!("Delay loop has stopped; dropping delayed add");
        }
    }

    /// Shut down the work queue and discard keys still waiting.
    pub async fn shut_down(&self) {
        let _ = self.stop_tx.send(true);
        self.queue.shut_down().await;
    }

    /// Shut down and wait for in-flight keys to be done.
    pub async fn shut_down_with_drain(&self) {
        let _ = self.stop_tx.send(true);
        self.queue.shut_down_with_drain().await;
    }
}

impl<K: QueueKey> Default for DelayingQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_delay_loop<K: QueueKey>(
    queue: WorkQueue<K>,
    mut delayed_rx: mpsc::UnboundedReceiver<DelayedAdd<K>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut waiting = WaitingSet::new();

    loop {
        for key in waiting.pop_ready(Instant::now()) {
            trace!(key = ?key, "Delay elapsed");
            queue.add(key).await;
        }

        let next = waiting.next_ready();
        let wait_for_next = async {
            match next {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = wait_for_next => {}
            add = delayed_rx.recv() => match add {
                Some(add) => waiting.insert(add),
                None => return,
            },
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    debug!(discarded = waiting.len(), "Delay loop stopped");
                    return;
                }
            }
        }
    }
}
