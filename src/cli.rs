//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use requeue::AppConfig;

/// requeue - reconcile controller runtime
#[derive(Parser, Debug)]
#[command(name = "requeue")]
#[command(version)]
#[command(about = "Deduplicating work queue and level-based reconcile controller")]
#[command(
    long_about = "requeue runs a pool of workers that converge entities on their declared spec. Changes are reduced to keys, failures back off per key, and finalizers hold deletions until cleanup is done."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the demo controller against an in-memory store
    Run(RunArgs),

    /// Print the effective configuration as TOML
    Config {
        /// Configuration file to load
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Configuration file to load
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of valid entities to create
    #[arg(short, long)]
    pub entities: Option<usize>,

    /// Number of reconcile workers
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Chance that a reconcile fails transiently, between 0 and 1
    #[arg(long)]
    pub failure_rate: Option<f64>,

    /// Seconds to run before deleting entities
    #[arg(short, long)]
    pub duration: Option<u64>,
}

impl RunArgs {
    /// Overlay flags given on the command line onto `config`.
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(entities) = self.entities {
            config.demo.entities = entities;
        }
        if let Some(workers) = self.workers {
            config.controller.workers = workers;
        }
        if let Some(rate) = self.failure_rate {
            config.demo.failure_rate = rate;
        }
        if let Some(duration) = self.duration {
            config.demo.duration_secs = duration;
        }
    }
}
