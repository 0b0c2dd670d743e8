//! # requeue - Controller Runtime Entry Point
//!
//! ## Commands
//!
//! - `run` - start the demo controller against an in-memory store, let it
//!   converge, delete a share of the entities, wait for finalizer cleanup,
//!   and print a summary
//! - `config` - print the effective configuration
//!
//! ## Configuration
//!
//! Settings come from defaults, then the TOML file given with `--config`,
//! then command-line flags. Log verbosity follows `RUST_LOG`.
//!
//! ## Shutdown
//!
//! Ctrl+C ends the observation window early; deletion and cleanup still run
//! so the summary reflects a drained controller.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use requeue::{AppConfig, demo};

use crate::cli::{Cli, Commands, RunArgs};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(&args).await,
        Commands::Config { config } => {
            let config = AppConfig::load_or_default(config.as_deref())
                .context("Failed to load configuration")?;
            print!("{}", config.to_toml().context("Failed to render configuration")?);
            Ok(())
        }
    }
}

async fn run(args: &RunArgs) -> Result<()> {
    let mut config = AppConfig::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    info!(
        controller = %config.controller.name,
        workers = config.controller.workers,
        entities = config.demo.entities,
        failure_rate = config.demo.failure_rate,
        "requeue demo starting"
    );

    let report = demo::run(&config, wait_for_shutdown()).await?;

    println!("{report}");
    if !report.registry_consistent {
        anyhow::bail!("registry does not match the remaining entities");
    }
    info!("requeue demo finished");
    Ok(())
}

/// Initialize tracing subscriber with environment filter.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for shutdown signal (Ctrl+C).
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(err) => {
            error!("Failed to listen for shutdown signal: {}", err);
            // Never resolve, so the configured duration decides.
            std::future::pending::<()>().await;
        }
    }
}
