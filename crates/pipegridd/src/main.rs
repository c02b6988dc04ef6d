//! pipegridd: the pipegrid daemon.
//!
//! Single binary that assembles:
//! - State store (redb)
//! - Desired-state authoring API
//! - Reconciliation loop against the Docker engine
//!
//! # Usage
//!
//! ```text
//! pipegridd run --config /etc/pipegrid/config.json --data-dir /var/lib/pipegrid
//! ```
//!
//! `SIGHUP` re-reads the configuration file and hot-restarts the loop with
//! it. Ctrl-C drains the loop and exits; executions keep running.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use pipegrid_driver::DockerConnector;
use pipegrid_orchestrator::{Orchestrator, OrchestratorConfig};
use pipegrid_state::StateStore;

const DEFAULT_LOG_FILTER: &str = "info,pipegridd=debug,pipegrid=debug";

#[derive(Parser)]
#[command(name = "pipegridd", about = "pipegrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the API and the reconciliation loop.
    Run {
        /// Loop configuration file (JSON).
        #[arg(long)]
        config: PathBuf,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/pipegrid")]
        data_dir: PathBuf,

        /// API port.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Key prefix the API writes under. Defaults to the configured
        /// repository prefix.
        #[arg(long)]
        prefix: Option<String>,

        /// Log output format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

struct RunArgs {
    config: PathBuf,
    data_dir: PathBuf,
    port: u16,
    prefix: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            port,
            prefix,
            log_format,
        } => {
            init_tracing(log_format);
            run(RunArgs {
                config,
                data_dir,
                port,
                prefix,
            })
            .await
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    info!("pipegrid daemon starting");

    let (config, blob) = read_config(&args.config).await?;
    let prefix = args.prefix.unwrap_or(config.repository.prefix);

    std::fs::create_dir_all(&args.data_dir)?;
    let db_path = args.data_dir.join("pipegrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    // ── Reconciliation loop ────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (configs_tx, configs_rx) = mpsc::channel(1);
    configs_tx.send(blob).await?;

    let orchestrator = Orchestrator::new(store.clone(), Arc::new(DockerConnector));
    let mut loop_handle = tokio::spawn(orchestrator.run(configs_rx, shutdown_rx.clone()));

    let reload_handle = tokio::spawn(reload_on_hangup(
        args.config.clone(),
        configs_tx,
        shutdown_rx.clone(),
    ));

    // ── API server ─────────────────────────────────────────────

    let router = pipegrid_api::build_router(store, &prefix);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, %prefix, "API server starting");

    let mut server_shutdown = shutdown_rx;
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await
    });

    // ── Shutdown ───────────────────────────────────────────────

    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to install Ctrl-C handler")?;
            info!("shutdown signal received");
            None
        }
        result = &mut loop_handle => Some(result),
    };
    shutdown_tx.send_replace(true);

    let outcome = match finished {
        Some(result) => result,
        None => loop_handle.await,
    };

    if let Err(e) = server_handle.await? {
        error!(error = %e, "API server failed");
    }
    let _ = reload_handle.await;

    outcome??;
    info!("pipegrid daemon stopped");
    Ok(())
}

/// Read and validate the loop configuration file.
async fn read_config(path: &Path) -> anyhow::Result<(OrchestratorConfig, Vec<u8>)> {
    let blob = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config = OrchestratorConfig::from_slice(&blob)
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok((config, blob))
}

/// Deliver the configuration file again on every `SIGHUP`. A file that no
/// longer decodes is rejected here so the running generation stays up.
#[cfg(unix)]
async fn reload_on_hangup(
    path: PathBuf,
    configs: mpsc::Sender<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "unable to install SIGHUP handler; configuration reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.wait_for(|stop| *stop) => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
            }
        }

        match read_config(&path).await {
            Ok((config, blob)) => {
                info!(prefix = %config.repository.prefix, "configuration reloaded");
                if configs.send(blob).await.is_err() {
                    return;
                }
            }
            Err(e) => error!(error = ?e, "configuration reload rejected"),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(
    _path: PathBuf,
    _configs: mpsc::Sender<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
