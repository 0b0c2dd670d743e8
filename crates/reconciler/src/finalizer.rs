//! Finalizer-guarded reconciliation.
//!
//! A finalizer is a marker on an entity that blocks its deletion until the
//! controller owning the marker has cleaned up after it. [`finalizer`]
//! drives the lifecycle:
//!
//! ```text
//! Absent ──create──▶ Active(no marker) ──add marker──▶ Active(marker)
//!                                                          │ delete
//!                                                          ▼
//! Absent ◀──store removes── Terminating(no marker) ◀──cleanup── Terminating(marker)
//! ```

use std::future::Future;

use requeue_core::ObjectKey;
use tracing::{debug, info};

use crate::error::ReconcileError;
use crate::retry::{WriteTarget, modify};
use crate::store::{EntityStore, Object, Payload};
use crate::types::Action;

/// Lifecycle state of an entity with respect to one finalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    /// The entity does not exist.
    Absent,
    /// The entity exists and no deletion has been requested.
    Active { has_finalizer: bool },
    /// Deletion has been requested.
    Terminating { has_finalizer: bool },
}

impl FinalizerState {
    #[must_use]
    pub fn observe<S, T>(object: Option<&Object<S, T>>, finalizer: &str) -> Self {
        match object {
            None => Self::Absent,
            Some(object) => {
                let has_finalizer = object.metadata.has_finalizer(finalizer);
                if object.metadata.is_deletion_requested() {
                    Self::Terminating { has_finalizer }
                } else {
                    Self::Active { has_finalizer }
                }
            }
        }
    }
}

/// What the handler passed to [`finalizer`] is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum FinalizerEvent<S, T> {
    /// Converge the entity towards its spec. The marker is in place.
    Apply(Object<S, T>),
    /// Release everything held on behalf of the entity.
    ///
    /// Returning [`Action::Done`] removes the marker and lets the deletion
    /// complete. Returning [`Action::RequeueAfter`] keeps the marker and
    /// asks to be called again, for cleanup that has to wait on something.
    Cleanup(Object<S, T>),
}

/// Reconcile `key` with `finalizer_name` protecting its deletion.
///
/// - Absent: nothing to do.
/// - Active without the marker: the marker is added first, then `handler`
///   is applied to the object as persisted.
/// - Active with the marker: `handler` applies.
/// - Terminating with the marker: `handler` cleans up, then the marker is
///   removed.
/// - Terminating without the marker: another party's finalizer is holding
///   the entity; nothing to do.
///
/// Marker writes go through [`modify`] and survive up to
/// `conflict_retries` version conflicts.
pub async fn finalizer<S, T, St, F, Fut>(
    store: &St,
    finalizer_name: &str,
    key: &ObjectKey,
    conflict_retries: u32,
    handler: F,
) -> Result<Action, ReconcileError>
where
    S: Payload,
    T: Payload,
    St: EntityStore<S, T> + ?Sized,
    F: FnOnce(FinalizerEvent<S, T>) -> Fut,
    Fut: Future<Output = Result<Action, ReconcileError>>,
{
    let object = store.get(key).await?;
    let state = FinalizerState::observe(object.as_ref(), finalizer_name);
    let Some(object) = object else {
        return Ok(Action::Done);
    };

    match state {
        FinalizerState::Absent | FinalizerState::Terminating { has_finalizer: false } => {
            Ok(Action::Done)
        }
        FinalizerState::Active { has_finalizer: true } => handler(FinalizerEvent::Apply(object)).await,
        FinalizerState::Active { has_finalizer: false } => {
            let persisted = modify(store, key, WriteTarget::Object, conflict_retries, |o| {
                !o.metadata.is_deletion_requested() && o.metadata.add_finalizer(finalizer_name)
            })
            .await?;
            match persisted {
                Some(object) if !object.metadata.is_deletion_requested() => {
                    debug!(key = %key, finalizer = finalizer_name, "Finalizer added");
                    handler(FinalizerEvent::Apply(object)).await
                }
                // Deleted or marked for deletion meanwhile; the change
                // notification brings the key back.
                _ => Ok(Action::Done),
            }
        }
        FinalizerState::Terminating { has_finalizer: true } => {
            match handler(FinalizerEvent::Cleanup(object)).await? {
                Action::Done => {
                    modify(store, key, WriteTarget::Object, conflict_retries, |o| {
                        o.metadata.remove_finalizer(finalizer_name)
                    })
                    .await?;
                    info!(key = %key, finalizer = finalizer_name, "Cleanup complete, finalizer removed");
                    Ok(Action::Done)
                }
                pending @ Action::RequeueAfter(_) => Ok(pending),
            }
        }
    }
}
