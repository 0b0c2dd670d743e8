//! Level-based reconcile controller.
//!
//! A controller keeps entities converged on their declared spec:
//!
//! - **Sources** turn store changes into keys on a deduplicating queue
//! - **Workers** take keys off the queue and run a [`Reconciler`]
//! - **Outcomes** decide what happens next: forget, requeue after a delay,
//!   retry with backoff, or report and stop
//!
//! Reconcilers never see the change that triggered them, only the key.
//! They read current state and act on it, so a burst of changes to one
//! entity costs one reconcile and a missed change is repaired by the next.
//!
//! # Finalizers
//!
//! [`finalizer`] wraps a reconcile so that deleting an entity waits until
//! the controller has released what it holds for that entity.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use requeue_reconciler::{
//!     Action, Controller, ControllerConfig, FnReconciler, InMemoryStore,
//! };
//!
//! let store = InMemoryStore::<MySpec, MyStatus>::new_arc();
//! let reconciler = Arc::new(FnReconciler::new(|key| async move {
//!     // read `key` from the store, converge, write status
//!     Ok(Action::done())
//! }));
//!
//! let controller = Controller::new(ControllerConfig::named("demo"), reconciler)?;
//! let source = controller.watch(store);
//! let stopper = controller.stopper();
//! tokio::spawn(async move {
//!     tokio::signal::ctrl_c().await.ok();
//!     stopper.stop_and_drain().await;
//! });
//! controller.run().await?;
//! source.abort();
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![forbid(clippy::panic)]

pub mod config;
pub mod controller;
pub mod error;
pub mod finalizer;
pub mod memory;
pub mod reconciler;
pub mod reporter;
pub mod retry;
pub mod source;
pub mod store;
pub mod types;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerStats, ControllerStopper};
pub use error::{Error, ReconcileError, Result, StoreError, StoreResult};
pub use finalizer::{FinalizerEvent, FinalizerState, finalizer};
pub use memory::InMemoryStore;
pub use reconciler::{FnReconciler, Reconciler};
pub use reporter::{ErrorReporter, TracingErrorReporter};
pub use retry::{DEFAULT_CONFLICT_RETRIES, WriteTarget, modify, retry_on_conflict};
pub use source::{KeySource, enqueue_all};
pub use store::{EntityStore, Metadata, Object, Payload, StoreEvent, StoreEventKind};
pub use types::{Action, Outcome};

pub use requeue_core::ObjectKey;
