//! fleetd: the fleetgrid manager daemon.
//!
//! Single binary that assembles the manager:
//! - Config store (redb)
//! - Manager service + task queue
//! - Pending / Scheduled / Done watchers
//! - REST API + Prometheus metrics
//!
//! # Usage
//!
//! ```text
//! fleetd serve --port 8443 --data-dir /var/lib/fleetgrid --config fleetd.toml
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fleetgrid_manager::{Manager, ManagerConfig, ManagerMetrics};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "fleetd", about = "fleetgrid manager daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the manager API and run the watchers.
    Serve {
        /// Port to listen on.
        #[arg(long, default_value = "8443")]
        port: u16,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,

        /// Manager configuration file (TOML).
        #[arg(long)]
        config: Option<PathBuf>,

        /// Watcher tick in seconds. Overrides the config file.
        #[arg(long)]
        watch_interval: Option<u64>,

        /// Lease of a claimed task, in watcher ticks. Overrides the config file.
        #[arg(long)]
        task_ttl: Option<u32>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,fleetd=debug,fleetgrid=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            port,
            data_dir,
            config,
            watch_interval,
            task_ttl,
        } => {
            let mut manager_config = match &config {
                Some(path) => ManagerConfig::from_file(path)?,
                None => ManagerConfig::default(),
            };
            if let Some(secs) = watch_interval {
                manager_config.watch_interval_secs = secs;
            }
            if let Some(ttl) = task_ttl {
                manager_config.task_ttl = ttl;
            }
            run_serve(port, data_dir, manager_config).await
        }
    }
}

async fn run_serve(port: u16, data_dir: PathBuf, config: ManagerConfig) -> anyhow::Result<()> {
    info!("fleetgrid manager starting");

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("fleetgrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = fleetgrid_state::StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let interval = config.watch_interval();
    info!(
        watch_interval_secs = interval.as_secs(),
        task_ttl = config.task_ttl,
        max_attempts = config.retry.max_attempts,
        "manager configured"
    );
    let metrics = Arc::new(ManagerMetrics::new());
    let manager = Arc::new(Manager::new(store, config, metrics));

    // ── Watchers ───────────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watchers = fleetgrid_manager::spawn_watchers(manager.clone(), interval, shutdown_rx);

    // ── API server ─────────────────────────────────────────────

    let router = fleetgrid_api::build_router(manager);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    for handle in watchers {
        let _ = handle.await;
    }

    info!("fleetgrid manager stopped");
    Ok(())
}
