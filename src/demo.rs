//! A self-contained demo controller.
//!
//! `Pinger` keeps a registry of ping targets in sync with `PingTarget`
//! entities in an in-memory store. Registration is guarded by a finalizer,
//! so deleting an entity always unregisters its target first. Probes fail
//! at random to show backoff, and entities with an empty target fail
//! terminally.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use requeue_reconciler::{
    Action, Controller, ControllerStats, EntityStore, FinalizerEvent, InMemoryStore, Object,
    ObjectKey, ReconcileError, Reconciler, WriteTarget, finalizer, modify,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::AppConfig;

pub const FINALIZER: &str = "requeue.dev/ping-registration";

const NAMESPACE: &str = "demo";

/// How long deleted entities get to finish cleanup.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingSpec {
    /// Host to ping. Empty is invalid.
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingStatus {
    /// Generation of the spec last applied.
    pub observed_generation: u64,
    /// Successful pings so far.
    pub pings: u64,
}

pub type PingTarget = Object<PingSpec, PingStatus>;

/// Reconciles `PingTarget` entities against a registry of targets.
pub struct Pinger {
    store: Arc<InMemoryStore<PingSpec, PingStatus>>,
    registry: Mutex<BTreeSet<ObjectKey>>,
    failure_rate: f64,
    interval: Duration,
    conflict_retries: u32,
}

impl Pinger {
    #[must_use]
    pub fn new(
        store: Arc<InMemoryStore<PingSpec, PingStatus>>,
        failure_rate: f64,
        interval: Duration,
        conflict_retries: u32,
    ) -> Self {
        Self {
            store,
            registry: Mutex::new(BTreeSet::new()),
            failure_rate,
            interval,
            conflict_retries,
        }
    }

    /// Keys currently registered.
    pub async fn registered(&self) -> BTreeSet<ObjectKey> {
        self.registry.lock().await.clone()
    }

    async fn apply(&self, key: &ObjectKey, target: &PingTarget) -> Result<Action, ReconcileError> {
        if target.spec.target.trim().is_empty() {
            return Err(ReconcileError::terminal("spec.target is empty"));
        }

        let ping_failed = rand::thread_rng().gen_bool(self.failure_rate);
        if ping_failed {
            return Err(ReconcileError::transient(format!(
                "ping of {} timed out",
                target.spec.target
            )));
        }

        if self.registry.lock().await.insert(key.clone()) {
            info!(host = %target.spec.target, "Registered ping target");
        }

        let generation = target.metadata.generation;
        modify(
            self.store.as_ref(),
            key,
            WriteTarget::Status,
            self.conflict_retries,
            |object: &mut PingTarget| {
                let status = object.status.get_or_insert_with(PingStatus::default);
                status.observed_generation = generation;
                status.pings = status.pings.saturating_add(1);
                true
            },
        )
        .await?;

        debug!(host = %target.spec.target, "Pinged");
        Ok(Action::requeue(self.interval))
    }

    async fn cleanup(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        if self.registry.lock().await.remove(key) {
            info!("Unregistered ping target");
        }
        Ok(Action::done())
    }
}

#[async_trait]
impl Reconciler for Pinger {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        finalizer(
            self.store.as_ref(),
            FINALIZER,
            key,
            self.conflict_retries,
            |event: FinalizerEvent<PingSpec, PingStatus>| async move {
                match event {
                    FinalizerEvent::Apply(target) => self.apply(key, &target).await,
                    FinalizerEvent::Cleanup(_) => self.cleanup(key).await,
                }
            },
        )
        .await
    }
}

/// What a demo run did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DemoReport {
    pub created: usize,
    pub deleted: usize,
    pub remaining: usize,
    pub registered: usize,
    /// Nothing is registered for an entity that is gone or invalid.
    pub registry_consistent: bool,
    pub stats: ControllerStats,
    pub elapsed_ms: u128,
}

impl fmt::Display for DemoReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "created:     {}", self.created)?;
        writeln!(f, "deleted:     {}", self.deleted)?;
        writeln!(f, "remaining:   {}", self.remaining)?;
        writeln!(
            f,
            "registered:  {} ({})",
            self.registered,
            if self.registry_consistent {
                "consistent"
            } else {
                "INCONSISTENT"
            }
        )?;
        writeln!(
            f,
            "reconciles:  {} succeeded, {} requeued, {} failed, {} terminal",
            self.stats.succeeded, self.stats.requeued, self.stats.failed, self.stats.terminal
        )?;
        write!(f, "elapsed:     {}ms", self.elapsed_ms)
    }
}

fn entity_key(index: usize) -> requeue_core::Result<ObjectKey> {
    ObjectKey::namespaced(NAMESPACE, format!("target-{index:03}"))
}

/// Run the demo: create entities, let the controller work until `stop`
/// resolves or the configured duration passes, delete a share of the
/// entities, wait for their cleanup, and shut down.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the store rejects a
/// write, or deleted entities are not released in time.
pub async fn run<F>(config: &AppConfig, stop: F) -> Result<DemoReport>
where
    F: Future<Output = ()>,
{
    config.validate().context("Invalid configuration")?;
    let started = Instant::now();
    let demo = &config.demo;

    let store = InMemoryStore::<PingSpec, PingStatus>::new_arc();
    let pinger = Arc::new(Pinger::new(
        Arc::clone(&store),
        demo.failure_rate,
        Duration::from_millis(demo.ping_interval_ms),
        config.controller.conflict_retries,
    ));
    let controller = Arc::new(
        Controller::new(config.controller.clone(), Arc::clone(&pinger))
            .context("Failed to build controller")?,
    );
    let source = controller.watch(Arc::clone(&store) as Arc<dyn EntityStore<_, _>>);
    let runner = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.run().await })
    };

    let total = demo.entities.saturating_add(demo.invalid);
    let keys = (0..total)
        .map(entity_key)
        .collect::<requeue_core::Result<Vec<_>>>()
        .context("Failed to build entity keys")?;
    for (index, key) in keys.iter().enumerate() {
        let target = if index < demo.entities {
            format!("host-{index}.example.internal")
        } else {
            String::new()
        };
        store
            .create(Object::new(key, PingSpec { target }))
            .await
            .with_context(|| format!("Failed to create {key}"))?;
    }
    info!(entities = demo.entities, invalid = demo.invalid, "Entities created");

    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(demo.duration_secs)) => {}
        () = stop => info!("Stop requested"),
    }

    let to_delete: Vec<&ObjectKey> = deletion_plan(total, demo.delete_fraction)
        .into_iter()
        .filter_map(|index| keys.get(index))
        .collect();
    for &key in &to_delete {
        store
            .delete(key)
            .await
            .with_context(|| format!("Failed to delete {key}"))?;
    }
    info!(count = to_delete.len(), "Deletion requested");

    let released = tokio::time::timeout(CLEANUP_TIMEOUT, async {
        for &key in &to_delete {
            while store.get(key).await.ok().flatten().is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    })
    .await;
    if released.is_err() {
        warn!("Deleted entities were not released in time");
    }

    controller.stopper().stop().await;
    let joined = runner.await.context("Controller task failed")?;
    source.abort();
    joined.context("Controller stopped with an error")?;
    released.context("Timed out waiting for finalizer cleanup")?;

    let remaining = store.list().await.context("Failed to list entities")?;
    let registered = pinger.registered().await;
    let expected: BTreeSet<ObjectKey> = remaining
        .iter()
        .filter(|o| !o.spec.target.trim().is_empty())
        .map(Object::key)
        .collect();

    Ok(DemoReport {
        created: total,
        deleted: to_delete.len(),
        remaining: remaining.len(),
        registered: registered.len(),
        registry_consistent: registered.is_subset(&expected),
        stats: controller.stats(),
        elapsed_ms: started.elapsed().as_millis(),
    })
}

/// Indices to delete: every `1 / fraction`-th entity, spread evenly.
fn deletion_plan(total: usize, fraction: f64) -> Vec<usize> {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let count = ((total as f64) * fraction).round() as usize;
    let count = count.min(total);
    (0..count)
        .filter_map(|i| i.checked_mul(total)?.checked_div(count))
        .collect()
}
