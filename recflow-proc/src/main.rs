//! recflow-proc - metadata processing daemon
//!
//! Opens the record store, recovers services a previous process left mid-run, then
//! runs queued service passes until interrupted.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use recflow_common::config::{self, RecflowConfig};
use recflow_common::db::init_database;
use recflow_common::events::EventBus;
use recflow_proc::scheduler::JobScheduler;
use recflow_proc::services::lifecycle;
use recflow_proc::AppState;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for recflow-proc
#[derive(Parser, Debug)]
#[command(name = "recflow-proc")]
#[command(about = "Metadata record processing pipeline")]
#[command(version)]
struct Args {
    /// Root folder holding the record database (overrides RECFLOW_ROOT)
    #[arg(short, long)]
    root_folder: Option<String>,

    /// Config file (defaults to the platform config location)
    #[arg(short, long, env = "RECFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Drain the job queue once and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "recflow_proc=info,recflow_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => RecflowConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RecflowConfig::load_or_default().context("Failed to load config")?,
    };
    let root_folder = config::resolve_root_folder(args.root_folder.as_deref(), &config);
    let db_path = RecflowConfig::database_path(&root_folder);
    info!("Starting recflow-proc {}", env!("CARGO_PKG_VERSION"));
    info!("Database: {}", db_path.display());

    let db = init_database(&db_path)
        .await
        .context("Failed to open database")?;
    let event_bus = EventBus::new(1000);
    let state = AppState::new(db, event_bus, config);

    let recovered = lifecycle::recover_interrupted_services(&state).await?;
    if !recovered.is_empty() {
        info!(count = recovered.len(), "Requeued interrupted services");
    }

    let scheduler = JobScheduler::new(state);
    if args.once {
        let outcomes = scheduler.run_until_idle().await?;
        info!(runs = outcomes.len(), "Job queue drained");
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });
    scheduler.run(shutdown).await?;

    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
