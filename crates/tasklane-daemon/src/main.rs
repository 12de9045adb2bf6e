//! tasklane-daemon - background sync for one data directory
//!
//! Ticks on a fixed interval, reconciling the local queue with the configured
//! backend (or only heartbeating in offline mode). Runs until SIGINT or
//! SIGTERM, then finishes the in-flight tick and releases its marker. Exits
//! with failure if another instance takes the marker over.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use libtasklane_core::config::{db_path, load_config, resolve_data_dir};
use libtasklane_core::DatabaseSource;
use libtasklane_sync::{DaemonConfig, DaemonError, StartOutcome, SyncDaemon};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "tasklane-daemon", about = "tasklane background sync daemon", version)]
struct Cli {
    /// Data directory (default: TASKLANE_HOME or the XDG data dir)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Seconds between ticks (default from config.toml)
    #[arg(long)]
    interval: Option<u64>,

    /// Heartbeat only, no remote sync
    #[arg(long)]
    offline: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(code = e.error_code(), "tasklane-daemon failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode, DaemonError> {
    let data_dir = resolve_data_dir(cli.data_dir.as_deref())?;
    std::fs::create_dir_all(&data_dir)?;

    let mut config = load_config(&data_dir)?;
    if let Some(secs) = cli.interval {
        config.interval_secs = secs;
    }
    if cli.offline {
        config.offline_mode = true;
    }
    config.validate()?;

    let source = DatabaseSource::on_disk(db_path(&data_dir));
    let daemon_config = DaemonConfig::from_sync_config(&data_dir, source, &config)?;

    info!(data_dir = %data_dir.display(), "tasklane-daemon starting");
    let mut handle = match SyncDaemon::start(daemon_config)? {
        StartOutcome::Started(handle) => handle,
        StartOutcome::AlreadyRunning { pid } => {
            error!(pid, "another daemon already owns {}", data_dir.display());
            return Ok(ExitCode::FAILURE);
        }
    };

    tokio::select! {
        _ = shutdown_signal() => info!("received shutdown signal"),
        _ = handle.exited() => {}
    }

    let status = handle.stop().await?;
    if status.marker_lost {
        error!("another daemon took over {}", data_dir.display());
        return Ok(ExitCode::FAILURE);
    }
    info!(ticks = status.sync_count, "tasklane-daemon stopped");
    Ok(ExitCode::SUCCESS)
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
