//! Disk usage probe
//!
//! Sidecar serving filesystem statistics for the PVCs mounted under a common
//! root, queried by the PVC autoscaler over `GET /disk`.

use anyhow::{Context, Result};
use autoscaler_lib::probe::{
    server::{router, ProbeState, StatvfsStatter},
    DEFAULT_MOUNT, PROBE_PORT,
};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Console,
    Json,
}

/// Disk usage probe for the PVC autoscaler
#[derive(Debug, Parser)]
#[command(name = "disk-probe")]
#[command(author, version, about = "Disk usage probe for the PVC autoscaler", long_about = None)]
pub struct Args {
    /// PVC names delimited by comma, each mounted at <mount>/<name>
    #[arg(long, env = "PROBE_VOLUMES", default_value = "")]
    pub volumes: String,

    /// Root directory the PVCs are mounted under
    #[arg(long, env = "PROBE_MOUNT", default_value = DEFAULT_MOUNT)]
    pub mount: PathBuf,

    /// Port to listen on
    #[arg(long, env = "PROBE_PORT", default_value_t = PROBE_PORT)]
    pub port: u16,

    /// Log output format
    #[arg(long, value_enum, default_value = "console")]
    pub log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Console => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .init(),
    }
}

/// Resolves on Ctrl-C, or on SIGTERM when the pod is stopped
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
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
    info!("Disk probe shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let state = ProbeState::new(&args.volumes, &args.mount, Arc::new(StatvfsStatter));
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {}", addr))?;

    info!(
        addr = %addr,
        mount = %args.mount.display(),
        volumes = ?state.volumes(),
        "Disk probe listening"
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
