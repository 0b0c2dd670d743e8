//! In-memory [`EntityStore`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use itertools::Itertools;
use requeue_core::ObjectKey;
use tokio::sync::{RwLock, broadcast};
use tracing::trace;

use crate::error::{StoreError, StoreResult};
use crate::store::{EntityStore, Object, Payload, StoreEvent, StoreEventKind};

const DEFAULT_EVENT_CAPACITY: usize = 1024;

struct State<S, T> {
    objects: HashMap<ObjectKey, Object<S, T>>,
    /// Last version handed out; versions are unique across the store.
    version: u64,
}

impl<S, T> State<S, T> {
    fn next_version(&mut self) -> u64 {
        self.version = self.version.saturating_add(1);
        self.version
    }
}

/// An [`EntityStore`] kept in a map, with change notifications on a
/// broadcast channel.
///
/// Suitable for tests and for single-process controllers.
pub struct InMemoryStore<S, T> {
    state: RwLock<State<S, T>>,
    events: broadcast::Sender<StoreEvent>,
}

impl<S: Payload, T: Payload> InMemoryStore<S, T> {
    #[must_use]
    pub fn new() -> Self {
        Self::with_event_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Subscribers that fall more than `capacity` events behind are told
    /// they lagged and must re-list.
    #[must_use]
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            state: RwLock::new(State {
                objects: HashMap::new(),
                version: 0,
            }),
            events,
        }
    }

    #[must_use]
    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.objects.is_empty()
    }

    fn emit(&self, kind: StoreEventKind, key: ObjectKey, resource_version: u64) {
        trace!(key = %key, ?kind, resource_version, "Store event");
        // No subscribers is not an error.
        let _ = self.events.send(StoreEvent {
            kind,
            key,
            resource_version,
        });
    }
}

impl<S: Payload, T: Payload> Default for InMemoryStore<S, T> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_version<S, T>(current: &Object<S, T>, incoming: &Object<S, T>) -> StoreResult<()> {
    if current.version() == incoming.version() {
        Ok(())
    } else {
        Err(StoreError::conflict(
            incoming.key(),
            incoming.version(),
            current.version(),
        ))
    }
}

#[async_trait]
impl<S: Payload, T: Payload> EntityStore<S, T> for InMemoryStore<S, T> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<Object<S, T>>> {
        Ok(self.state.read().await.objects.get(key).cloned())
    }

    async fn list(&self) -> StoreResult<Vec<Object<S, T>>> {
        let state = self.state.read().await;
        Ok(state
            .objects
            .values()
            .sorted_by(|a, b| a.metadata.key.cmp(&b.metadata.key))
            .cloned()
            .collect())
    }

    async fn create(&self, mut object: Object<S, T>) -> StoreResult<Object<S, T>> {
        let key = object.key();
        let mut state = self.state.write().await;
        if state.objects.contains_key(&key) {
            return Err(StoreError::already_exists(key));
        }

        object.metadata.resource_version = state.next_version();
        object.metadata.generation = 1;
        object.metadata.deletion_timestamp = None;
        state.objects.insert(key.clone(), object.clone());
        drop(state);

        self.emit(StoreEventKind::Created, key, object.version());
        Ok(object)
    }

    async fn update(&self, object: Object<S, T>) -> StoreResult<Object<S, T>> {
        let key = object.key();
        let mut state = self.state.write().await;
        let version = state.version.saturating_add(1);
        let current = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found(key.clone()))?;
        check_version(current, &object)?;

        if current.spec != object.spec {
            current.metadata.generation = current.metadata.generation.saturating_add(1);
        }
        current.spec = object.spec;
        current.metadata.finalizers = object.metadata.finalizers;
        current.metadata.resource_version = version;
        let updated = current.clone();
        state.version = version;

        let released =
            updated.metadata.is_deletion_requested() && updated.metadata.finalizers.is_empty();
        if released {
            state.objects.remove(&key);
        }
        drop(state);

        let kind = if released {
            StoreEventKind::Deleted
        } else {
            StoreEventKind::Updated
        };
        self.emit(kind, key, version);
        Ok(updated)
    }

    async fn update_status(&self, object: Object<S, T>) -> StoreResult<Object<S, T>> {
        let key = object.key();
        let mut state = self.state.write().await;
        let version = state.version.saturating_add(1);
        let current = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found(key.clone()))?;
        check_version(current, &object)?;

        current.status = object.status;
        current.metadata.resource_version = version;
        let updated = current.clone();
        state.version = version;
        drop(state);

        self.emit(StoreEventKind::Updated, key, version);
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let version = state.version.saturating_add(1);
        let current = state
            .objects
            .get_mut(key)
            .ok_or_else(|| StoreError::not_found(key.clone()))?;

        if current.metadata.finalizers.is_empty() {
            state.objects.remove(key);
            state.version = version;
            drop(state);
            self.emit(StoreEventKind::Deleted, key.clone(), version);
            return Ok(());
        }

        if current.metadata.is_deletion_requested() {
            return Ok(());
        }
        current.metadata.deletion_timestamp = Some(Utc::now());
        current.metadata.resource_version = version;
        state.version = version;
        drop(state);

        self.emit(StoreEventKind::Updated, key.clone(), version);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    const FINALIZER: &str = "example.io/cleanup";

    type Store = InMemoryStore<String, u32>;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::namespaced("ns", name).unwrap()
    }

    #[tokio::test]
    async fn test_create_assigns_version_and_generation() {
        let store = Store::new();
        let created = store
            .create(Object::new(&key("a"), "v1".to_string()))
            .await
            .unwrap();
        assert!(created.version() > 0);
        assert_eq!(created.metadata.generation, 1);

        let dup = store.create(Object::new(&key("a"), "v1".to_string())).await;
        assert_eq!(dup, Err(StoreError::already_exists(key("a"))));
    }

    /// Given two writers holding the same version
    /// When both update
    /// Then the second is rejected with a conflict naming both versions
    #[tokio::test]
    async fn test_stale_update_conflicts() {
        let store = Store::new();
        let created = store
            .create(Object::new(&key("a"), "v1".to_string()))
            .await
            .unwrap();

        let mut first = created.clone();
        first.spec = "v2".to_string();
        let updated = store.update(first).await.unwrap();
        assert_eq!(updated.metadata.generation, 2);

        let mut second = created.clone();
        second.spec = "v3".to_string();
        let err = store.update(second).await.unwrap_err();
        assert_eq!(
            err,
            StoreError::conflict(key("a"), created.version(), updated.version())
        );
    }

    #[tokio::test]
    async fn test_status_update_leaves_generation() {
        let store = Store::new();
        let mut object = store
            .create(Object::new(&key("a"), "v1".to_string()))
            .await
            .unwrap();
        object.status = Some(7);
        object.spec = "ignored".to_string();

        let updated = store.update_status(object).await.unwrap();
        assert_eq!(updated.status, Some(7));
        assert_eq!(updated.spec, "v1");
        assert_eq!(updated.metadata.generation, 1);
    }

    #[tokio::test]
    async fn test_delete_without_finalizers_removes() {
        let store = Store::new();
        store
            .create(Object::new(&key("a"), "v1".to_string()))
            .await
            .unwrap();
        store.delete(&key("a")).await.unwrap();
        assert_eq!(store.get(&key("a")).await.unwrap(), None);
        assert_eq!(
            store.delete(&key("a")).await,
            Err(StoreError::not_found(key("a")))
        );
    }

    /// Given an entity carrying a finalizer
    /// When deletion is requested and the finalizer is later removed
    /// Then the entity lingers with a deletion timestamp, then disappears
    #[tokio::test]
    async fn test_finalizer_blocks_delete_until_removed() {
        let store = Store::new();
        store
            .create(Object::new(&key("a"), "v1".to_string()).with_finalizer(FINALIZER))
            .await
            .unwrap();

        store.delete(&key("a")).await.unwrap();
        let mut terminating = store.get(&key("a")).await.unwrap().unwrap();
        assert!(terminating.metadata.is_deletion_requested());

        terminating.metadata.remove_finalizer(FINALIZER);
        store.update(terminating).await.unwrap();
        assert_eq!(store.get(&key("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_events_follow_writes() {
        let store = Store::new();
        let mut events = store.subscribe();

        let created = store
            .create(Object::new(&key("a"), "v1".to_string()))
            .await
            .unwrap();
        store.update_status(created).await.unwrap();
        store.delete(&key("a")).await.unwrap();

        let kinds: Vec<_> = (0..3).map(|_| events.try_recv().unwrap().kind).collect();
        assert_eq!(
            kinds,
            vec![
                StoreEventKind::Created,
                StoreEventKind::Updated,
                StoreEventKind::Deleted
            ]
        );
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_key() {
        let store = Store::new();
        for name in ["c", "a", "b"] {
            store
                .create(Object::new(&key(name), String::new()))
                .await
                .unwrap();
        }
        let names: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key().name().to_owned())
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }
}
