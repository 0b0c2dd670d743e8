//! The controller: a pool of workers draining a rate-limited queue of keys.
//!
//! Each worker loops on `get`, runs the reconciler for the key inside a
//! span carrying a fresh `reconcile_id`, translates the result into an
//! [`Outcome`], applies the matching queue operation, and calls `done`.
//! The queue guarantees no two workers hold the same key at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use requeue_core::ObjectKey;
use requeue_workqueue::{RateLimitingQueue, default_controller_rate_limiter};
use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{Instrument, debug, error, info, info_span, warn};
use ulid::Ulid;

use crate::config::ControllerConfig;
use crate::error::{Error, ReconcileError, Result};
use crate::reconciler::Reconciler;
use crate::reporter::{ErrorReporter, TracingErrorReporter};
use crate::source::KeySource;
use crate::store::{EntityStore, Payload};
use crate::types::Outcome;

/// Outcome counts since the controller was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ControllerStats {
    pub succeeded: u64,
    pub requeued: u64,
    pub failed: u64,
    pub terminal: u64,
}

impl ControllerStats {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.succeeded
            .saturating_add(self.requeued)
            .saturating_add(self.failed)
            .saturating_add(self.terminal)
    }
}

#[derive(Debug, Default)]
struct Counters {
    succeeded: AtomicU64,
    requeued: AtomicU64,
    failed: AtomicU64,
    terminal: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &Outcome) {
        let counter = match outcome {
            Outcome::Succeeded => &self.succeeded,
            Outcome::SucceededRequeueAfter(_) => &self.requeued,
            Outcome::Failed(_) => &self.failed,
            Outcome::FailedTerminal(_) => &self.terminal,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ControllerStats {
        ControllerStats {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            terminal: self.terminal.load(Ordering::Relaxed),
        }
    }
}

/// Runs a [`Reconciler`] for every key added to its queue.
pub struct Controller<R: ?Sized> {
    config: ControllerConfig,
    name: Arc<str>,
    queue: RateLimitingQueue<ObjectKey>,
    reconciler: Arc<R>,
    reporter: Arc<dyn ErrorReporter>,
    counters: Arc<Counters>,
}

impl<R: Reconciler + ?Sized + 'static> Controller<R> {
    /// Create a controller with the default per-key backoff plus global
    /// bucket rate limiter.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ControllerConfig, reconciler: Arc<R>) -> Result<Self> {
        config.validate()?;
        let limiter = default_controller_rate_limiter::<ObjectKey>(&config.rate_limiter)?;
        let queue = RateLimitingQueue::new(Arc::new(limiter));
        Ok(Self::with_queue(config, reconciler, queue))
    }

    /// Create a controller draining an existing queue.
    pub fn with_queue(
        config: ControllerConfig,
        reconciler: Arc<R>,
        queue: RateLimitingQueue<ObjectKey>,
    ) -> Self {
        Self {
            name: Arc::from(config.name.as_str()),
            config,
            queue,
            reconciler,
            reporter: Arc::new(TracingErrorReporter),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Send terminal failures to `reporter` instead of the log.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// The queue workers drain. Adding a key here schedules a reconcile.
    #[must_use]
    pub const fn queue(&self) -> &RateLimitingQueue<ObjectKey> {
        &self.queue
    }

    #[must_use]
    pub fn stats(&self) -> ControllerStats {
        self.counters.snapshot()
    }

    /// A handle that stops [`Controller::run`] from another task.
    #[must_use]
    pub fn stopper(&self) -> ControllerStopper {
        ControllerStopper {
            queue: self.queue.clone(),
        }
    }

    /// Feed every key in `store`, and every later change to it, into the
    /// queue. Honors the configured resync period.
    pub fn watch<S: Payload, T: Payload>(&self, store: Arc<dyn EntityStore<S, T>>) -> JoinHandle<()> {
        KeySource::new(store, self.queue.clone())
            .with_resync(self.config.resync_period())
            .spawn()
    }

    /// Run the workers until the queue is shut down and drained.
    ///
    /// # Errors
    ///
    /// Returns an error if a worker task fails.
    pub async fn run(&self) -> Result<()> {
        info!(
            controller = %self.name,
            workers = self.config.workers,
            "Controller starting"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers {
            let worker = Worker {
                id,
                name: Arc::clone(&self.name),
                queue: self.queue.clone(),
                reconciler: Arc::clone(&self.reconciler),
                reporter: Arc::clone(&self.reporter),
                counters: Arc::clone(&self.counters),
            };
            workers.spawn(worker.run());
        }

        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                error!(controller = %self.name, error = %err, "Worker task failed");
                failure.get_or_insert_with(|| Error::worker_failed(err.to_string()));
            }
        }

        let stats = self.stats();
        info!(
            controller = %self.name,
            succeeded = stats.succeeded,
            requeued = stats.requeued,
            failed = stats.failed,
            terminal = stats.terminal,
            "Controller stopped"
        );
        failure.map_or(Ok(()), Err)
    }
}

/// Stops a running [`Controller`].
#[derive(Clone)]
pub struct ControllerStopper {
    queue: RateLimitingQueue<ObjectKey>,
}

impl ControllerStopper {
    /// Stop accepting keys. Workers finish what is already queued and exit;
    /// keys waiting on a delay are dropped.
    pub async fn stop(&self) {
        self.queue.shut_down().await;
    }

    /// Like [`ControllerStopper::stop`], but returns only once every
    /// in-flight reconcile has finished.
    pub async fn stop_and_drain(&self) {
        self.queue.shut_down_with_drain().await;
    }
}

struct Worker<R: ?Sized> {
    id: usize,
    name: Arc<str>,
    queue: RateLimitingQueue<ObjectKey>,
    reconciler: Arc<R>,
    reporter: Arc<dyn ErrorReporter>,
    counters: Arc<Counters>,
}

impl<R: Reconciler + ?Sized + 'static> Worker<R> {
    async fn run(self) {
        debug!(controller = %self.name, worker = self.id, "Worker started");
        while let Some(key) = self.queue.get().await {
            self.process(&key).await;
            self.queue.done(&key).await;
        }
        debug!(controller = %self.name, worker = self.id, "Worker stopped");
    }

    async fn process(&self, key: &ObjectKey) {
        let reconcile_id = Ulid::new();
        let span = info_span!(
            "reconcile",
            controller = %self.name,
            key = %key,
            reconcile_id = %reconcile_id,
        );

        async {
            let started = Instant::now();
            let outcome = self.invoke(key).await;
            debug!(
                outcome = outcome.label(),
                elapsed = ?started.elapsed(),
                "Reconcile finished"
            );
            self.counters.record(&outcome);
            self.apply(key, outcome).await;
        }
        .instrument(span)
        .await;
    }

    /// Run the reconciler on its own task so a panic becomes a failure for
    /// this key instead of taking the worker down.
    async fn invoke(&self, key: &ObjectKey) -> Outcome {
        let reconciler = Arc::clone(&self.reconciler);
        let owned = key.clone();
        let task = tokio::spawn(
            async move { reconciler.reconcile(&owned).await }.in_current_span(),
        );
        match task.await {
            Ok(result) => Outcome::from(result),
            Err(err) => Outcome::Failed(ReconcileError::transient(format!(
                "reconciler task failed: {err}"
            ))),
        }
    }

    async fn apply(&self, key: &ObjectKey, outcome: Outcome) {
        match outcome {
            Outcome::Succeeded => self.queue.forget(key),
            Outcome::SucceededRequeueAfter(after) => {
                self.queue.forget(key);
                debug!(after = ?after, "Requeue requested");
                self.queue.add_after(key.clone(), after).await;
            }
            Outcome::Failed(err) => {
                let delay = self.queue.add_rate_limited(key.clone()).await;
                warn!(
                    error = %err,
                    retry_in = ?delay,
                    failures = self.queue.num_requeues(key),
                    "Reconcile failed, will retry"
                );
            }
            Outcome::FailedTerminal(err) => {
                self.queue.forget(key);
                self.reporter.report(&self.name, key, &err);
            }
        }
    }
}
