//! Where terminal reconcile failures go.

use requeue_core::ObjectKey;
use tracing::error;

use crate::error::ReconcileError;

/// Receives failures the controller will not retry.
///
/// Terminal failures stop the key's retries until something changes it,
/// so they need a destination a human will see.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, controller: &str, key: &ObjectKey, error: &ReconcileError);
}

/// Reports terminal failures as `error` level tracing events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, controller: &str, key: &ObjectKey, error: &ReconcileError) {
        error!(controller, key = %key, error = %error, "Terminal reconcile failure");
    }
}
