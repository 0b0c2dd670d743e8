//! Entity model and the store the controller reads and writes through.
//!
//! Every entity carries [`Metadata`] with a version token that changes on
//! each write. Writes made with a stale token fail with
//! [`StoreError::Conflict`] so a reconciler never overwrites a change it
//! has not seen.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use requeue_core::ObjectKey;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{StoreError, StoreResult};

/// Bound shared by entity spec and status payloads.
pub trait Payload: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Payload for T where T: Clone + PartialEq + Send + Sync + std::fmt::Debug + 'static {}

/// Identity, versioning and lifecycle fields common to all entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Identity, serialized as `namespace/name`.
    pub key: ObjectKey,

    /// Opaque version token, bumped by the store on every write.
    #[serde(default)]
    pub resource_version: u64,

    /// Bumped by the store when the spec changes.
    #[serde(default)]
    pub generation: u64,

    /// Markers that must all be removed before the entity is deleted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,

    /// Set by the store when deletion has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl Metadata {
    #[must_use]
    pub fn for_key(key: &ObjectKey) -> Self {
        Self {
            key: key.clone(),
            resource_version: 0,
            generation: 0,
            finalizers: Vec::new(),
            deletion_timestamp: None,
        }
    }

    #[must_use]
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns `true` if the marker was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_owned());
        true
    }

    /// Returns `true` if the marker was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }

    #[must_use]
    pub const fn is_deletion_requested(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// A stored entity: metadata, desired state, and observed status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object<S, T> {
    pub metadata: Metadata,
    pub spec: S,
    #[serde(default)]
    pub status: Option<T>,
}

impl<S, T> Object<S, T> {
    pub fn new(key: &ObjectKey, spec: S) -> Self {
        Self {
            metadata: Metadata::for_key(key),
            spec,
            status: None,
        }
    }

    #[must_use]
    pub fn with_finalizer(mut self, finalizer: &str) -> Self {
        self.metadata.add_finalizer(finalizer);
        self
    }

    #[must_use]
    pub fn key(&self) -> ObjectKey {
        self.metadata.key.clone()
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.metadata.resource_version
    }
}

/// What happened to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreEventKind {
    Created,
    Updated,
    Deleted,
}

/// A change notification.
///
/// Carries the key only. Consumers re-read current state from the store
/// rather than trusting a payload that may already be stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: StoreEventKind,
    pub key: ObjectKey,
    pub resource_version: u64,
}

/// Persistence the controller reconciles against.
#[async_trait]
pub trait EntityStore<S, T>: Send + Sync
where
    S: Payload,
    T: Payload,
{
    /// Current state of `key`, or `None` if it does not exist.
    async fn get(&self, key: &ObjectKey) -> StoreResult<Option<Object<S, T>>>;

    /// Every entity, ordered by key.
    async fn list(&self) -> StoreResult<Vec<Object<S, T>>>;

    /// Insert a new entity. Server-managed metadata is assigned by the store.
    async fn create(&self, object: Object<S, T>) -> StoreResult<Object<S, T>>;

    /// Replace spec and finalizers if `object`'s version is current.
    ///
    /// Status and deletion timestamp are left as stored. An entity whose
    /// deletion was requested is removed once its last finalizer is gone.
    async fn update(&self, object: Object<S, T>) -> StoreResult<Object<S, T>>;

    /// Replace status only, if `object`'s version is current.
    async fn update_status(&self, object: Object<S, T>) -> StoreResult<Object<S, T>>;

    /// Request deletion. Entities without finalizers are removed at once;
    /// others get a deletion timestamp and stay until their finalizers are
    /// cleared.
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;

    /// Subscribe to change notifications from this point on.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}
