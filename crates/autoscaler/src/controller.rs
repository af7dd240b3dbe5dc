//! Reconcile driver for PodDiskInspectors
//!
//! Runs one autoscaling pass (collect, then resize) per PodDiskInspector and
//! requeues it. Pod changes trigger a pass for the inspector named in the pod's
//! annotations. The same pod watch feeds the cache the collector lists
//! instances from. The controller runtime never runs two passes for the same
//! inspector at once, which the resize engine's read-modify-write of the
//! scaling history relies on.

use crate::config::AutoscalerConfig;
use anyhow::Context as _;
use autoscaler_lib::{
    crd::{is_enabled, owner_key},
    health::{Component, HealthRegistry},
    observability::{AutoscalerMetrics, StructuredLogger},
    probe::HttpUsageClient,
    CollectError, CollectorConfig, JoinedErrors, KubeStore, PodDiskInspector, ResizeEngine,
    ScaleError, UsageCollector,
};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Event reason for collection failures
pub const REASON_COLLECT: &str = "PVCAutoScaleCollectUsage";
/// Event reason for resize failures
pub const REASON_RESIZE: &str = "PVCAutoScaleResize";

/// Why an autoscaling pass failed
#[derive(Debug, Error)]
pub enum PassError {
    #[error("no default PVCScalingSpec found in PodDiskInspectorSpec")]
    MissingPolicy,

    #[error("collect pvc disk usage: {0}")]
    Collect(#[from] CollectError),

    #[error("process pvc resize: {0}")]
    Resize(#[from] JoinedErrors<ScaleError>),
}

impl PassError {
    /// Event reason and note published on the PodDiskInspector
    fn event(&self) -> (&'static str, String) {
        match self {
            PassError::MissingPolicy => (REASON_COLLECT, self.to_string()),
            // Collection errors are noisy; details are in the logs
            PassError::Collect(_) => (REASON_COLLECT, "failed to collect pvc disk usage".to_string()),
            PassError::Resize(errors) => (REASON_RESIZE, errors.to_string()),
        }
    }
}

/// State shared by every reconcile
pub struct Context {
    client: Client,
    reporter: Reporter,
    collector: UsageCollector<HttpUsageClient, KubeStore>,
    engine: ResizeEngine<KubeStore>,
    health: HealthRegistry,
    metrics: AutoscalerMetrics,
    logger: StructuredLogger,
    requeue: Duration,
}

impl Context {
    pub fn new(
        client: Client,
        pods: Store<Pod>,
        config: &AutoscalerConfig,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        let store = Arc::new(KubeStore::new(client.clone(), pods, &config.controller_name));
        let probes = Arc::new(HttpUsageClient::new(reqwest::Client::new()));

        Self {
            reporter: Reporter {
                controller: config.controller_name.clone(),
                instance: std::env::var("POD_NAME").ok(),
            },
            collector: UsageCollector::new(
                probes,
                Arc::clone(&store),
                CollectorConfig {
                    probe_timeout: config.probe_timeout(),
                },
            ),
            engine: ResizeEngine::new(store, logger.clone()),
            client,
            health,
            metrics: AutoscalerMetrics::new(),
            logger,
            requeue: config.requeue_interval(),
        }
    }

    /// Collect usage and resize the inspector's PVCs once
    async fn run_pass(&self, inspector: &PodDiskInspector) -> Result<(), PassError> {
        if inspector.spec.pvc_scaling.is_none() {
            return Err(PassError::MissingPolicy);
        }
        let key = inspector.key().to_string();

        let started = Instant::now();
        let collected = self.collector.collect(inspector).await;
        self.metrics
            .observe_collection_latency(started.elapsed().as_secs_f64());

        let records = match collected {
            Ok(records) => {
                self.health.pass_succeeded(Component::Collector).await;
                records
            }
            Err(err) => {
                self.logger.log_collection_failed(&key, &err.to_string());
                self.health
                    .pass_failed(Component::Collector, format!("{}: {}", key, err))
                    .await;
                return Err(err.into());
            }
        };
        self.metrics.set_volumes_observed(records.len() as i64);

        let outcome = self
            .engine
            .process(inspector, &records, &inspector.history())
            .await;
        if outcome.resource_gone() {
            debug!(inspector = %key, "PodDiskInspector deleted during pass");
            return Ok(());
        }

        match outcome.into_result() {
            Ok(_) => {
                self.health.pass_succeeded(Component::Scaler).await;
                Ok(())
            }
            Err(errors) => {
                self.health
                    .pass_failed(Component::Scaler, format!("{}: {} errors", key, errors.len()))
                    .await;
                Err(errors.into())
            }
        }
    }

    async fn publish_warning(&self, inspector: &PodDiskInspector, reason: &str, note: String) {
        let recorder = Recorder::new(
            self.client.clone(),
            self.reporter.clone(),
            inspector.object_ref(&()),
        );
        let event = Event {
            type_: EventType::Warning,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = recorder.publish(event).await {
            warn!(inspector = %inspector.key(), error = %e, "Failed to publish event");
        }
    }
}

async fn reconcile(inspector: Arc<PodDiskInspector>, ctx: Arc<Context>) -> Result<Action, PassError> {
    debug!(inspector = %inspector.key(), "Entering reconcile loop");

    if let Err(err) = ctx.run_pass(&inspector).await {
        let (reason, note) = err.event();
        ctx.publish_warning(&inspector, reason, note).await;
        return Err(err);
    }
    Ok(Action::requeue(ctx.requeue))
}

fn error_policy(inspector: Arc<PodDiskInspector>, err: &PassError, ctx: Arc<Context>) -> Action {
    warn!(inspector = %inspector.key(), error = %err, "Autoscaling pass failed");
    ctx.metrics.inc_pass_errors();
    Action::requeue(ctx.requeue)
}

/// Map a pod to the PodDiskInspector its annotations point at
pub fn inspector_for_pod(pod: Pod) -> Option<ObjectRef<PodDiskInspector>> {
    let annotations = pod.annotations();
    if !is_enabled(annotations) {
        return None;
    }
    let owner = owner_key(annotations)?;
    Some(ObjectRef::new(&owner.name).within(&owner.namespace))
}

/// Run the controller until a shutdown signal arrives
///
/// `pods` is the writer half of the cache handed to [`Context::new`].
pub async fn run(client: Client, ctx: Arc<Context>, pods: Writer<Pod>) -> anyhow::Result<()> {
    let inspectors: Api<PodDiskInspector> = Api::all(client.clone());
    let pod_api: Api<Pod> = Api::all(client);

    inspectors
        .list(&ListParams::default().limit(1))
        .await
        .context("PodDiskInspector CRD is not installed")?;

    ctx.health.controller_started().await;
    info!("Starting PodDiskInspector controller");

    let pod_events = watcher(pod_api, watcher::Config::default())
        .default_backoff()
        .reflect(pods)
        .touched_objects();

    let health = ctx.health.clone();
    let stream = Controller::new(inspectors, watcher::Config::default())
        .watches_stream(pod_events, inspector_for_pod)
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx);
    tokio::pin!(stream);

    while let Some(result) = stream.next().await {
        match result {
            Ok((inspector, _)) => debug!(inspector = %inspector, "Reconciled"),
            Err(e) => debug!(error = %e, "Reconcile did not complete"),
        }
    }

    health.controller_stopped("controller stream ended").await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use autoscaler_lib::crd::{OPERATOR_ENABLED, OPERATOR_NAME, OPERATOR_NAMESPACE};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("db-0".to_string()),
                namespace: Some("apps".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_enabled_pod_maps_to_its_inspector() {
        let target = inspector_for_pod(pod(&[
            (OPERATOR_ENABLED, "true"),
            (OPERATOR_NAME, "inspector"),
            (OPERATOR_NAMESPACE, "ops"),
        ]))
        .unwrap();
        assert_eq!(target.name, "inspector");
        assert_eq!(target.namespace.as_deref(), Some("ops"));
    }

    #[test]
    fn test_disabled_or_unowned_pods_are_ignored() {
        assert!(inspector_for_pod(pod(&[
            (OPERATOR_ENABLED, "false"),
            (OPERATOR_NAME, "inspector"),
            (OPERATOR_NAMESPACE, "ops"),
        ]))
        .is_none());
        assert!(inspector_for_pod(pod(&[(OPERATOR_ENABLED, "true"), (OPERATOR_NAME, "inspector")]))
            .is_none());
        assert!(inspector_for_pod(pod(&[])).is_none());
    }

    #[test]
    fn test_collect_failures_publish_a_generic_note() {
        let (reason, note) = PassError::Collect(CollectError::NoInstancesFound).event();
        assert_eq!(reason, REASON_COLLECT);
        assert_eq!(note, "failed to collect pvc disk usage");

        let (reason, note) = PassError::MissingPolicy.event();
        assert_eq!(reason, REASON_COLLECT);
        assert!(note.contains("PVCScalingSpec"));
    }

    #[test]
    fn test_resize_failures_publish_every_error() {
        let errors = JoinedErrors::new(vec![
            ScaleError::ResourceGone {
                resource: "ops/a".to_string(),
            },
            ScaleError::ResourceGone {
                resource: "ops/b".to_string(),
            },
        ]);
        let (reason, note) = PassError::Resize(errors).event();
        assert_eq!(reason, REASON_RESIZE);
        assert_eq!(note, "ops/a no longer exists\nops/b no longer exists");
    }
}
