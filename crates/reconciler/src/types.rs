//! Reconcile results.

use std::time::Duration;

use crate::error::ReconcileError;

/// What a successful reconcile asks of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Converged; wait for the next change.
    Done,
    /// Converged for now; look again after the given delay.
    RequeueAfter(Duration),
}

impl Action {
    #[must_use]
    pub const fn done() -> Self {
        Self::Done
    }

    #[must_use]
    pub const fn requeue(after: Duration) -> Self {
        Self::RequeueAfter(after)
    }
}

/// How one reconcile invocation ended.
///
/// Each variant maps to exactly one queue operation in the controller:
///
/// | Outcome                 | Queue                                   |
/// |-------------------------|-----------------------------------------|
/// | `Succeeded`             | `forget`                                |
/// | `SucceededRequeueAfter` | `forget`, then `add_after`              |
/// | `Failed`                | `add_rate_limited`                      |
/// | `FailedTerminal`        | `forget`, report, no requeue            |
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    SucceededRequeueAfter(Duration),
    Failed(ReconcileError),
    FailedTerminal(ReconcileError),
}

impl Outcome {
    /// Short label for logs and counters.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::SucceededRequeueAfter(_) => "requeue_after",
            Self::Failed(_) => "failed",
            Self::FailedTerminal(_) => "failed_terminal",
        }
    }

    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::SucceededRequeueAfter(_))
    }
}

impl From<Result<Action, ReconcileError>> for Outcome {
    fn from(result: Result<Action, ReconcileError>) -> Self {
        match result {
            Ok(Action::Done) => Self::Succeeded,
            // A zero requeue is an immediate look-again, not a failure.
            Ok(Action::RequeueAfter(after)) => Self::SucceededRequeueAfter(after),
            Err(err) if err.is_terminal() => Self::FailedTerminal(err),
            Err(err) => Self::Failed(err),
        }
    }
}
