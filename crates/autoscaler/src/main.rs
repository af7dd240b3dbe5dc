//! PVC autoscaler - grows PersistentVolumeClaims before they fill up
//!
//! This binary runs the PodDiskInspector controller: it polls the disk probe
//! sidecars of annotated pods and requests larger PVCs when usage crosses the
//! configured threshold.

use autoscaler_lib::{
    health::HealthRegistry,
    observability::{AutoscalerMetrics, StructuredLogger},
};
use anyhow::Result;
use kube::runtime::reflector;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;
mod controller;

const AUTOSCALER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting pvc-autoscaler");

    let config = config::AutoscalerConfig::load()?;
    info!(
        controller = %config.controller_name,
        requeue_interval_secs = config.requeue_interval_secs,
        probe_timeout_secs = config.probe_timeout_secs,
        "Autoscaler configured"
    );

    let health_registry = HealthRegistry::new();

    let metrics = AutoscalerMetrics::new();

    let logger = StructuredLogger::new(&config.controller_name);
    logger.log_startup(AUTOSCALER_VERSION, config.api_port);

    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    let client = kube::Client::try_default().await?;
    let (pod_cache, pod_writer) = reflector::store();
    let ctx = Arc::new(controller::Context::new(
        client.clone(),
        pod_cache,
        &config,
        health_registry,
        logger.clone(),
    ));

    // The controller stops on SIGINT/SIGTERM
    let result = controller::run(client, ctx, pod_writer).await;
    api_handle.abort();

    match &result {
        Ok(()) => logger.log_shutdown("signal received"),
        Err(e) => {
            error!(error = %e, "Controller failed");
            logger.log_shutdown("controller failed");
        }
    }
    result
}
