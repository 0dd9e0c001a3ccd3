//! Reaper Daemon
//!
//! Hosts a fleet of worker loops that delete expired catalog entries and
//! their replication obligations. Runs continuously by default; `--once`
//! executes a single reap cycle per worker and exits.

use anyhow::{Context, Result};
use clap::Parser;
use common::{Catalog, Configuration};
use reaper::{DeletionGateway, FleetCoordinator, ReaperMetrics, WorkSource};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "reaperd.toml")]
    config: String,

    /// Run one reap cycle per worker and exit
    #[arg(long)]
    once: bool,
}

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::info!("Received SIGINT"),
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::info!("Received Ctrl+C");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    // Load configuration
    let config = if std::path::Path::new(&args.config).exists() {
        Configuration::load_from_path(std::path::Path::new(&args.config))
            .context("Failed to load configuration")?
    } else {
        log::info!("Configuration file not found, using defaults");
        Configuration::load().context("Failed to load configuration")?
    };

    config
        .reaper
        .validate()
        .context("Invalid reaper configuration")?;

    // Check if the reaper is enabled
    if !config.reaper.enabled {
        log::info!("Reaper is disabled in configuration (reaper.enabled = false)");
        log::info!("Set REAPERD__REAPER__ENABLED=true or enable in config file to run the reaper");
        return Ok(());
    }

    log::info!("Starting reaper daemon");

    // Connect to the catalog database (initializes the schema)
    let catalog = Arc::new(
        Catalog::new(&config.database.dsn)
            .await
            .context("Failed to connect to catalog database")?,
    );

    let source: Arc<dyn WorkSource> = Arc::clone(&catalog) as Arc<dyn WorkSource>;
    let gateway: Arc<dyn DeletionGateway> = catalog as Arc<dyn DeletionGateway>;

    let metrics = ReaperMetrics::new();
    let mut coordinator =
        FleetCoordinator::new(config.reaper.clone(), source, gateway, metrics.clone());

    if args.once {
        coordinator.start(true);
        coordinator.join().await;
    } else {
        coordinator.start(false);

        log::info!("Reaper daemon running, waiting for shutdown signal");
        wait_for_shutdown_signal().await?;

        log::info!("Received shutdown signal, stopping reaper daemon");
        coordinator.shutdown().await;
    }

    // Log metrics summary on exit
    metrics.summary().log();

    log::info!("Reaper daemon stopped");

    Ok(())
}
