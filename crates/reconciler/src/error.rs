//! Error types for the reconciler crate.
//!
//! Three layers:
//! - [`StoreError`] - what an [`crate::EntityStore`] reports
//! - [`ReconcileError`] - what a reconcile invocation reports, classified
//!   as transient (retry with backoff), terminal (do not retry) or a
//!   version conflict
//! - [`Error`] - controller setup and lifecycle failures

use requeue_core::ObjectKey;
use thiserror::Error;

/// Result type alias for controller operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by an entity store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The write carried a stale version token.
    #[error("conflict on '{key}': expected version {expected}, found {actual}")]
    Conflict {
        key: ObjectKey,
        expected: u64,
        actual: u64,
    },

    #[error("'{key}' not found")]
    NotFound { key: ObjectKey },

    #[error("'{key}' already exists")]
    AlreadyExists { key: ObjectKey },

    /// The store could not be reached or refused the request.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },
}

impl StoreError {
    pub fn conflict(key: ObjectKey, expected: u64, actual: u64) -> Self {
        Self::Conflict {
            key,
            expected,
            actual,
        }
    }

    pub fn not_found(key: ObjectKey) -> Self {
        Self::NotFound { key }
    }

    pub fn already_exists(key: ObjectKey) -> Self {
        Self::AlreadyExists { key }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Why a reconcile invocation failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// Worth retrying after a backoff.
    #[error("transient failure: {reason}")]
    Transient { reason: String },

    /// Retrying will not help; the key waits for its next external change.
    #[error("terminal failure: {reason}")]
    Terminal { reason: String },

    /// A write lost an optimistic-concurrency race and retries ran out.
    #[error("version conflict on '{key}' persisted after retries")]
    Conflict { key: ObjectKey },
}

impl ReconcileError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        Self::Terminal {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. })
    }
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { key, .. } => Self::Conflict { key },
            other => Self::transient(other.to_string()),
        }
    }
}

/// Controller setup and lifecycle errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] requeue_core::Error),

    /// A worker task panicked or was cancelled.
    #[error("worker failed: {reason}")]
    WorkerFailed { reason: String },
}

impl Error {
    pub fn worker_failed(reason: impl Into<String>) -> Self {
        Self::WorkerFailed {
            reason: reason.into(),
        }
    }
}
