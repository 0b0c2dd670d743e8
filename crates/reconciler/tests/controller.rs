//! Controller behavior end to end: workers, outcomes, and shutdown.
//!
//! Tests verify that:
//! - Transient failures are retried with backoff until they succeed
//! - Requeue-after schedules another pass without counting as a failure
//! - Terminal failures are reported once and not retried
//! - One key is never reconciled by two workers at once
//! - A panicking reconciler costs one failed attempt, not a worker
//! - An out-of-range requeue delay does not take a worker down
//! - Store changes drive a finalizer-protected reconciler through deletion

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{Entity, Event, FINALIZER, InstrumentedStore, Status, entity, key, wait_until, wait_until_absent};
use requeue_reconciler::{
    Action, Controller, ControllerConfig, EntityStore, ErrorReporter, FinalizerEvent,
    FnReconciler, ObjectKey, ReconcileError, Reconciler, WriteTarget, finalizer, modify,
};
use requeue_workqueue::RateLimiterConfig;

fn config(workers: usize) -> ControllerConfig {
    ControllerConfig {
        name: "test".to_string(),
        workers,
        rate_limiter: RateLimiterConfig {
            base_delay_ms: 10,
            max_delay_secs: 1,
            ..RateLimiterConfig::default()
        },
        ..ControllerConfig::default()
    }
}

fn start<R: Reconciler + 'static>(
    controller: Controller<R>,
) -> (Arc<Controller<R>>, tokio::task::JoinHandle<requeue_reconciler::Result<()>>) {
    let controller = Arc::new(controller);
    let runner = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run().await })
    };
    (controller, runner)
}

#[derive(Default)]
struct CollectingReporter {
    reports: Mutex<Vec<(String, ObjectKey, ReconcileError)>>,
}

impl ErrorReporter for CollectingReporter {
    fn report(&self, controller: &str, key: &ObjectKey, error: &ReconcileError) {
        self.reports
            .lock()
            .unwrap()
            .push((controller.to_string(), key.clone(), error.clone()));
    }
}

/// Given a reconciler that fails twice before succeeding
/// When its key is queued
/// Then it is retried until success and its backoff is forgotten
#[tokio::test]
async fn transient_failures_retry_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let reconciler = {
        let calls = Arc::clone(&calls);
        FnReconciler::new(move |_key: ObjectKey| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err::<Action, _>(ReconcileError::transient("not yet"))
                } else {
                    Ok(Action::done())
                }
            }
        })
    };
    let (controller, runner) = start(Controller::new(config(2), Arc::new(reconciler)).unwrap());

    controller.queue().add(key("flaky")).await;
    wait_until("third attempt", || controller.stats().succeeded == 1).await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(controller.stats().failed, 2);
    assert_eq!(controller.queue().num_requeues(&key("flaky")), 0);

    controller.stopper().stop_and_drain().await;
    runner.await.unwrap().unwrap();
}

/// Given a reconciler asking to look again shortly
/// When its key is processed
/// Then it runs again after the delay with no failure recorded
#[tokio::test]
async fn requeue_after_runs_again_without_backoff() {
    let calls = Arc::new(AtomicU32::new(0));
    let reconciler = {
        let calls = Arc::clone(&calls);
        FnReconciler::new(move |_key: ObjectKey| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Ok::<_, ReconcileError>(Action::requeue(Duration::from_millis(30)))
                } else {
                    Ok(Action::done())
                }
            }
        })
    };
    let (controller, runner) = start(Controller::new(config(1), Arc::new(reconciler)).unwrap());

    controller.queue().add(key("poll")).await;
    wait_until("second pass", || calls.load(Ordering::SeqCst) == 2).await;

    wait_until("second outcome", || controller.stats().succeeded == 1).await;
    let stats = controller.stats();
    assert_eq!(stats.requeued, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(controller.queue().num_requeues(&key("poll")), 0);

    controller.stopper().stop().await;
    runner.await.unwrap().unwrap();
}

/// Given a reconciler that rejects its input outright
/// When its key is processed
/// Then the failure is reported once and the key is not retried
#[tokio::test]
async fn terminal_failure_is_reported_not_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let reconciler = {
        let calls = Arc::clone(&calls);
        FnReconciler::new(move |_key: ObjectKey| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<Action, _>(ReconcileError::terminal("spec names an unknown region")) }
        })
    };
    let reporter = Arc::new(CollectingReporter::default());
    let controller = Controller::new(config(2), Arc::new(reconciler))
        .unwrap()
        .with_reporter(reporter.clone());
    let (controller, runner) = start(controller);

    controller.queue().add(key("bad")).await;
    wait_until("terminal outcome", || controller.stats().terminal == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let reports = reporter.reports.lock().unwrap().clone();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "test");
    assert_eq!(reports[0].1, key("bad"));
    assert!(reports[0].2.is_terminal());
    assert_eq!(controller.queue().len().await, 0);

    controller.stopper().stop().await;
    runner.await.unwrap().unwrap();
}

/// Given four workers and keys re-added while they are being processed
/// When the controller runs
/// Then no key is ever held by two workers at once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_key_is_never_reconciled_concurrently() {
    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let overlap = Arc::new(AtomicBool::new(false));
    let calls = Arc::new(AtomicU32::new(0));

    let reconciler = {
        let in_flight = Arc::clone(&in_flight);
        let overlap = Arc::clone(&overlap);
        let calls = Arc::clone(&calls);
        FnReconciler::new(move |key: ObjectKey| {
            let in_flight = Arc::clone(&in_flight);
            let overlap = Arc::clone(&overlap);
            let calls = Arc::clone(&calls);
            async move {
                if !in_flight.lock().unwrap().insert(key.clone()) {
                    overlap.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.lock().unwrap().remove(&key);
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ReconcileError>(Action::done())
            }
        })
    };
    let (controller, runner) = start(Controller::new(config(4), Arc::new(reconciler)).unwrap());

    for round in 0..20 {
        for name in ["a", "b", "c"] {
            controller.queue().add(key(name)).await;
        }
        if round % 5 == 0 {
            tokio::time::sleep(Duration::from_millis(3)).await;
        }
    }
    wait_until("queue drained", || calls.load(Ordering::SeqCst) >= 3).await;
    controller.stopper().stop_and_drain().await;
    runner.await.unwrap().unwrap();

    assert!(!overlap.load(Ordering::SeqCst));
}

/// Given a reconciler that panics on its first call
/// When its key is processed
/// Then the panic counts as a failure and the key succeeds on retry
#[tokio::test]
async fn panicking_reconciler_is_retried() {
    let calls = Arc::new(AtomicU32::new(0));
    let reconciler = {
        let calls = Arc::clone(&calls);
        FnReconciler::new(move |_key: ObjectKey| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                assert!(attempt > 0, "first attempt blows up");
                Ok::<_, ReconcileError>(Action::done())
            }
        })
    };
    let (controller, runner) = start(Controller::new(config(1), Arc::new(reconciler)).unwrap());

    controller.queue().add(key("fragile")).await;
    wait_until("recovery", || controller.stats().succeeded == 1).await;
    assert_eq!(controller.stats().failed, 1);

    controller.stopper().stop().await;
    runner.await.unwrap().unwrap();
}

/// Given a single worker and a reconciler asking for a requeue too far
/// out for the clock to represent
/// When that key and then another are processed
/// Then the worker survives and reconciles the second key
#[tokio::test]
async fn unrepresentable_requeue_delay_keeps_worker_alive() {
    let reconciled = Arc::new(Mutex::new(Vec::new()));
    let reconciler = {
        let reconciled = Arc::clone(&reconciled);
        FnReconciler::new(move |key: ObjectKey| {
            reconciled.lock().unwrap().push(key.name().to_string());
            let action = if key.name() == "forever" {
                Action::requeue(Duration::MAX)
            } else {
                Action::done()
            };
            async move { Ok::<_, ReconcileError>(action) }
        })
    };
    let (controller, runner) = start(Controller::new(config(1), Arc::new(reconciler)).unwrap());

    controller.queue().add(key("forever")).await;
    controller.queue().add(key("next")).await;
    wait_until("both reconciled", || controller.stats().total() == 2).await;

    assert_eq!(*reconciled.lock().unwrap(), vec!["forever", "next"]);
    assert_eq!(controller.stats().requeued, 1);
    assert!(!runner.is_finished());

    controller.stopper().stop_and_drain().await;
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn stop_releases_idle_workers() {
    let reconciler = FnReconciler::new(|_key: ObjectKey| async { Ok::<_, ReconcileError>(Action::done()) });
    let (controller, runner) = start(Controller::new(config(3), Arc::new(reconciler)).unwrap());

    tokio::time::sleep(Duration::from_millis(10)).await;
    controller.stopper().stop().await;

    let result = tokio::time::timeout(Duration::from_secs(1), runner).await;
    assert!(result.unwrap().unwrap().is_ok());
    assert_eq!(controller.stats().total(), 0);
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let reconciler = FnReconciler::new(|_key: ObjectKey| async { Ok::<_, ReconcileError>(Action::done()) });
    let result = Controller::new(config(0), Arc::new(reconciler));
    assert!(matches!(result, Err(requeue_reconciler::Error::Core(_))));
}

/// Reconciles entities behind a finalizer, recording the generation it
/// applied in status.
struct Tracker {
    store: Arc<InstrumentedStore>,
    cleanups: AtomicU32,
}

#[async_trait::async_trait]
impl Reconciler for Tracker {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let store = self.store.as_ref();
        finalizer(store, FINALIZER, key, 5, |event: Event| async move {
            match event {
                FinalizerEvent::Apply(object) => {
                    let generation = object.metadata.generation;
                    modify(store, key, WriteTarget::Status, 5, |o: &mut Entity| {
                        let status = o.status.get_or_insert_with(Status::default);
                        if status.observed_generation == generation {
                            return false;
                        }
                        status.observed_generation = generation;
                        status.applies += 1;
                        true
                    })
                    .await?;
                    Ok(Action::done())
                }
                FinalizerEvent::Cleanup(_) => {
                    self.cleanups.fetch_add(1, Ordering::SeqCst);
                    Ok(Action::done())
                }
            }
        })
        .await
    }
}

/// Given a controller watching a store
/// When an entity is created and later deleted
/// Then it is converged with a finalizer, and deletion waits for cleanup
#[tokio::test]
async fn watched_entity_converges_and_is_released() {
    let store = InstrumentedStore::new_arc();
    let tracker = Arc::new(Tracker {
        store: Arc::clone(&store),
        cleanups: AtomicU32::new(0),
    });
    let (controller, runner) = start(Controller::new(config(2), Arc::clone(&tracker)).unwrap());
    let source = controller.watch(store.clone() as Arc<dyn EntityStore<_, _>>);

    store.create(entity("web")).await.unwrap();
    let mut converged = false;
    for _ in 0..500 {
        let current = store.get(&key("web")).await.unwrap().unwrap();
        if current.metadata.has_finalizer(FINALIZER)
            && current.status.as_ref().is_some_and(|s| s.observed_generation == 1)
        {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(converged, "entity never converged");

    store.delete(&key("web")).await.unwrap();
    wait_until_absent(store.as_ref(), &key("web")).await;
    assert_eq!(tracker.cleanups.load(Ordering::SeqCst), 1);

    controller.stopper().stop_and_drain().await;
    runner.await.unwrap().unwrap();
    source.abort();
}
