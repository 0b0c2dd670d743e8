//! Optimistic-concurrency retry.
//!
//! A write that loses a version race is retried after re-reading current
//! state. Conflicts are expected under concurrency and are not failures
//! until the attempts run out.

use std::future::Future;
use std::time::Duration;

use requeue_core::ObjectKey;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{EntityStore, Object, Payload};

/// Attempts made by [`retry_on_conflict`] when the caller has no opinion.
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;

/// Pause between attempts, multiplied by the attempt number.
const CONFLICT_BACKOFF_STEP: Duration = Duration::from_millis(10);

/// Run `op` until it succeeds, fails with something other than a conflict,
/// or has been tried `attempts` times.
///
/// `op` must re-read the entity on each call; retrying a write with the
/// same stale version would conflict again.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        let result = op().await;
        if !pause_after_conflict(&result, attempt, attempts).await {
            return result;
        }
        attempt = attempt.saturating_add(1);
    }
}

/// Sleep and return `true` if `result` is a conflict worth another attempt.
async fn pause_after_conflict<T>(result: &StoreResult<T>, attempt: u32, attempts: u32) -> bool {
    match result {
        Err(StoreError::Conflict {
            key,
            expected,
            actual,
        }) if attempt < attempts => {
            debug!(key = %key, expected, actual, attempt, "Version conflict, retrying");
            tokio::time::sleep(CONFLICT_BACKOFF_STEP.saturating_mul(attempt)).await;
            true
        }
        _ => false,
    }
}

/// Which part of an entity a read-modify-write replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// Spec and finalizers, through [`EntityStore::update`].
    Object,
    /// Status, through [`EntityStore::update_status`].
    Status,
}

/// Read `key`, apply `mutate`, and write it back, retrying on conflict.
///
/// `mutate` is applied afresh to the re-read object on every attempt and
/// returns whether it changed anything; when it does not, no write is made
/// and the current object is returned. Returns `None` if the entity does
/// not exist (or vanished between attempts).
pub async fn modify<S, T, St, F>(
    store: &St,
    key: &ObjectKey,
    target: WriteTarget,
    attempts: u32,
    mutate: F,
) -> StoreResult<Option<Object<S, T>>>
where
    S: Payload,
    T: Payload,
    St: EntityStore<S, T> + ?Sized,
    F: Fn(&mut Object<S, T>) -> bool,
{
    let mutate = &mutate;
    retry_on_conflict(attempts, move || modify_once(store, key, target, mutate)).await
}

async fn modify_once<S, T, St, F>(
    store: &St,
    key: &ObjectKey,
    target: WriteTarget,
    mutate: &F,
) -> StoreResult<Option<Object<S, T>>>
where
    S: Payload,
    T: Payload,
    St: EntityStore<S, T> + ?Sized,
    F: Fn(&mut Object<S, T>) -> bool,
{
    let Some(mut object) = store.get(key).await? else {
        return Ok(None);
    };
    if !mutate(&mut object) {
        return Ok(Some(object));
    }
    let written = match target {
        WriteTarget::Object => store.update(object).await,
        WriteTarget::Status => store.update_status(object).await,
    };
    match written {
        Ok(object) => Ok(Some(object)),
        // Deleted underneath us.
        Err(StoreError::NotFound { .. }) => Ok(None),
        Err(err) => Err(err),
    }
}
