#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # requeue
//!
//! Deduplicating, rate-limited work queue and level-based reconcile
//! controller.
//!
//! This library re-exports the workspace crates and adds the pieces the
//! `requeue` binary is built from: TOML configuration and a demo
//! controller.

pub use requeue_core;
pub use requeue_reconciler;
pub use requeue_workqueue;

pub mod config;
pub mod demo;

pub use config::{AppConfig, DemoConfig};
pub use demo::{DemoReport, Pinger};
