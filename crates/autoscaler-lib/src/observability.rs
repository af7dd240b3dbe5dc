//! Observability infrastructure for the PVC autoscaler
//!
//! Provides:
//! - Prometheus metrics (collection latency, probe failures, patches, pass errors)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for collection latency (in seconds); probes time out at 10s
const LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AutoscalerMetricsInner> = OnceLock::new();

struct AutoscalerMetricsInner {
    collection_latency_seconds: Histogram,
    probe_failures: IntCounter,
    patches_issued: IntCounter,
    patch_failures: IntCounter,
    pass_errors: IntCounter,
    volumes_observed: IntGauge,
}

impl AutoscalerMetricsInner {
    fn new() -> Self {
        Self {
            collection_latency_seconds: register_histogram!(
                "pvc_autoscaler_collection_latency_seconds",
                "Time spent collecting disk usage for one PodDiskInspector",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register collection_latency_seconds"),

            probe_failures: register_int_counter!(
                "pvc_autoscaler_probe_failures_total",
                "Total number of pods whose disk probe could not be used"
            )
            .expect("Failed to register probe_failures"),

            patches_issued: register_int_counter!(
                "pvc_autoscaler_patches_issued_total",
                "Total number of PVC capacity increases requested"
            )
            .expect("Failed to register patches_issued"),

            patch_failures: register_int_counter!(
                "pvc_autoscaler_patch_failures_total",
                "Total number of PVC capacity increases that failed"
            )
            .expect("Failed to register patch_failures"),

            pass_errors: register_int_counter!(
                "pvc_autoscaler_pass_errors_total",
                "Total number of autoscaling passes that ended with an error"
            )
            .expect("Failed to register pass_errors"),

            volumes_observed: register_int_gauge!(
                "pvc_autoscaler_volumes_observed",
                "Number of PVCs reported by the most recent collection"
            )
            .expect("Failed to register volumes_observed"),
        }
    }
}

/// Autoscaler metrics for Prometheus exposition
///
/// A lightweight handle to the global metrics instance. Clones share the
/// same underlying metrics.
#[derive(Clone)]
pub struct AutoscalerMetrics {
    _private: (),
}

impl Default for AutoscalerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AutoscalerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AutoscalerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AutoscalerMetricsInner {
        GLOBAL_METRICS.get_or_init(AutoscalerMetricsInner::new)
    }

    pub fn observe_collection_latency(&self, duration_secs: f64) {
        self.inner().collection_latency_seconds.observe(duration_secs);
    }

    pub fn inc_probe_failures(&self, count: u64) {
        self.inner().probe_failures.inc_by(count);
    }

    pub fn inc_patches_issued(&self) {
        self.inner().patches_issued.inc();
    }

    pub fn inc_patch_failures(&self) {
        self.inner().patch_failures.inc();
    }

    pub fn inc_pass_errors(&self) {
        self.inner().pass_errors.inc();
    }

    pub fn set_volumes_observed(&self, count: i64) {
        self.inner().volumes_observed.set(count);
    }
}

/// Structured logger for autoscaler events
///
/// Emits stable `event` names so log pipelines can match on them.
#[derive(Clone)]
pub struct StructuredLogger {
    controller: String,
}

impl StructuredLogger {
    pub fn new(controller: impl Into<String>) -> Self {
        Self {
            controller: controller.into(),
        }
    }

    pub fn log_patch_issued(
        &self,
        volume: &str,
        percent_used: i32,
        current: &str,
        requested: &str,
    ) {
        info!(
            event = "pvc_patch_issued",
            controller = %self.controller,
            pvc = %volume,
            percent_used = percent_used,
            current_size = %current,
            requested_size = %requested,
            "Requested PVC capacity increase"
        );
    }

    pub fn log_patch_failed(&self, volume: &str, requested: &str, error: &str) {
        warn!(
            event = "pvc_patch_failed",
            controller = %self.controller,
            pvc = %volume,
            requested_size = %requested,
            error = %error,
            "Failed to request PVC capacity increase"
        );
    }

    pub fn log_history_persisted(&self, resource: &str, entries: usize) {
        info!(
            event = "scaling_history_persisted",
            controller = %self.controller,
            resource = %resource,
            entries = entries,
            "Persisted scaling history"
        );
    }

    pub fn log_collection_failed(&self, resource: &str, error: &str) {
        warn!(
            event = "collection_failed",
            controller = %self.controller,
            resource = %resource,
            error = %error,
            "Failed to collect disk usage"
        );
    }

    pub fn log_startup(&self, version: &str, api_port: u16) {
        info!(
            event = "autoscaler_started",
            controller = %self.controller,
            version = %version,
            api_port = api_port,
            "PVC autoscaler started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "autoscaler_shutdown",
            controller = %self.controller,
            reason = %reason,
            "PVC autoscaler shutting down"
        );
    }
}
