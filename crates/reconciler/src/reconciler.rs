//! The reconcile contract.

use std::future::Future;

use async_trait::async_trait;
use requeue_core::ObjectKey;

use crate::error::ReconcileError;
use crate::types::Action;

/// Drives one entity from its actual state towards its desired state.
///
/// Implementations receive only a key. They must read current state from
/// the store on every call and must be idempotent: the controller may call
/// them any number of times for the same key, and calls for one key never
/// overlap.
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;
}

/// A [`Reconciler`] built from an async closure.
pub struct FnReconciler<F> {
    f: F,
}

impl<F> FnReconciler<F> {
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Reconciler for FnReconciler<F>
where
    F: Fn(ObjectKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Action, ReconcileError>> + Send,
{
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        (self.f)(key.clone()).await
    }
}
