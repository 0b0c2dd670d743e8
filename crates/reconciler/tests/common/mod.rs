//! Shared fixtures for reconciler integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use requeue_reconciler::{
    EntityStore, FinalizerEvent, InMemoryStore, Object, ObjectKey, StoreError, StoreEvent,
    StoreResult,
};
use tokio::sync::broadcast;
use tokio::time::Instant;

pub const FINALIZER: &str = "requeue.dev/cleanup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spec {
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    pub observed_generation: u64,
    pub applies: u32,
}

pub type Entity = Object<Spec, Status>;

pub type Event = FinalizerEvent<Spec, Status>;

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::namespaced("default", name).unwrap()
}

pub fn entity(name: &str) -> Entity {
    Object::new(
        &key(name),
        Spec {
            target: format!("{name}.svc"),
        },
    )
}

/// An in-memory store that counts writes and can be told to fail the
/// next few writes with a version conflict.
#[derive(Default)]
pub struct InstrumentedStore {
    inner: InMemoryStore<Spec, Status>,
    writes: AtomicU32,
    pending_conflicts: AtomicU32,
}

impl InstrumentedStore {
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn inject_conflicts(&self, count: u32) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    fn check_write(&self, object: &Entity) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StoreError::conflict(
                object.key(),
                object.version(),
                object.version() + 1,
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EntityStore<Spec, Status> for InstrumentedStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<Entity>> {
        self.inner.get(key).await
    }

    async fn list(&self) -> StoreResult<Vec<Entity>> {
        self.inner.list().await
    }

    async fn create(&self, object: Entity) -> StoreResult<Entity> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.create(object).await
    }

    async fn update(&self, object: Entity) -> StoreResult<Entity> {
        self.check_write(&object)?;
        self.inner.update(object).await
    }

    async fn update_status(&self, object: Entity) -> StoreResult<Entity> {
        self.check_write(&object)?;
        self.inner.update_status(object).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.subscribe()
    }
}

/// Poll `check` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Poll the store until `key` is gone, failing the test after five seconds.
pub async fn wait_until_absent(store: &dyn EntityStore<Spec, Status>, key: &ObjectKey) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if store.get(key).await.unwrap().is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {key} to be deleted");
}
