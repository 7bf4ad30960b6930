//! flowplaned — the flowplane daemon.
//!
//! Single binary that assembles all flowplane subsystems:
//! - State store (redb)
//! - Schedule producer
//! - Work queues + capacity manager
//! - Dispatcher + subprocess backend
//! - Run tracker
//! - Event binder
//! - REST API
//!
//! # Usage
//!
//! ```text
//! flowplaned serve --config /etc/flowplane/flowplane.toml --port 4200 --data-dir /var/lib/flowplane
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use flowplane_core::ControlPlaneConfig;
use flowplaned::ControlPlane;

const DEFAULT_LOG_FILTER: &str = "info,flowplaned=debug,flowplane=debug";

#[derive(Parser)]
#[command(name = "flowplaned", about = "flowplane daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every subsystem in one process.
    Serve {
        /// Path to flowplane.toml. Built-in defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides `server.port`).
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state (overrides `server.data_dir`).
        #[arg(long)]
        data_dir: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "text")]
        log_format: LogFormat,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            log_format,
        } => {
            init_tracing(log_format);
            let mut config = match config {
                Some(path) => ControlPlaneConfig::from_file(&path)?,
                None => ControlPlaneConfig::default(),
            };
            if let Some(port) = port {
                config.server.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.server.data_dir = data_dir;
            }
            serve(config).await
        }
    }
}

async fn serve(config: ControlPlaneConfig) -> anyhow::Result<()> {
    info!("flowplane daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let mut control_plane = ControlPlane::open(&config)?;
    info!(
        scheduler_interval = ?config.scheduler.loop_interval,
        dispatcher_interval = ?config.dispatcher.loop_interval,
        heartbeat_timeout = ?config.tracker.heartbeat_timeout,
        global_limit = ?config.capacity.global_limit(),
        "control plane initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let handles = control_plane.spawn_loops(shutdown_rx);

    // ── Start API server ───────────────────────────────────────

    let router = control_plane.router();
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));

    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C.
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    // Wait for background tasks.
    for handle in handles {
        let _ = handle.await;
    }

    info!("flowplane daemon stopped");
    Ok(())
}
