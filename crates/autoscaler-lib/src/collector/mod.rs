//! Disk usage collection for a PodDiskInspector
//!
//! Queries the probe of every pod owned by a PodDiskInspector concurrently,
//! correlates each reported volume with its PVC to learn the real capacity,
//! and resolves the effective scaling policy from the inspector's default
//! and the pod and PVC annotations.
//!
//! A failing pod does not fail the pass. Only when every pod fails is the
//! joined set of errors returned.


use crate::crd::{ObjectKey, PodDiskInspector};
use crate::error::{CollectError, FetchError, JoinedErrors};
use crate::observability::AutoscalerMetrics;
use crate::policy::{resolve_policy, ScalingPolicy};
use crate::probe::{probe_address, DiskUsageResponse, UsageClient};
use crate::quantity::StorageQuantity;
use crate::store::ResourceStore;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Resource name of storage requests and capacity
pub const STORAGE: &str = "storage";

/// Immutable copy of the PVC fields needed to build a resize patch
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeSnapshot {
    pub key: ObjectKey,
    /// `spec.resources.requests` as read during collection
    pub requests: BTreeMap<String, Quantity>,
}

/// Disk usage of one PVC, rebuilt on every pass
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub volume: VolumeSnapshot,
    /// Used space, 0-100
    pub percent_used: i32,
    /// Capacity reported in the PVC status
    pub capacity: StorageQuantity,
    /// Effective policy after annotation overrides
    pub policy: Option<ScalingPolicy>,
}

impl UsageRecord {
    pub fn key(&self) -> &ObjectKey {
        &self.volume.key
    }
}

/// Configuration for the usage collector
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Upper bound for a single probe request (default: 10 seconds)
    pub probe_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
        }
    }
}

/// Records and per-volume errors produced by one pod
#[derive(Debug, Default)]
struct InstanceUsage {
    records: Vec<UsageRecord>,
    errors: Vec<CollectError>,
}

/// Collects disk usage for every PVC of the pods owned by an inspector
pub struct UsageCollector<C, S> {
    client: Arc<C>,
    store: Arc<S>,
    config: CollectorConfig,
    metrics: AutoscalerMetrics,
}

impl<C, S> UsageCollector<C, S>
where
    C: UsageClient + 'static,
    S: ResourceStore + 'static,
{
    pub fn new(client: Arc<C>, store: Arc<S>, config: CollectorConfig) -> Self {
        Self {
            client,
            store,
            config,
            metrics: AutoscalerMetrics::new(),
        }
    }

    /// Collect usage records for all PVCs of the inspector's pods
    ///
    /// Records come back in no particular order. Dropping the returned
    /// future aborts probes still in flight.
    pub async fn collect(
        &self,
        inspector: &PodDiskInspector,
    ) -> Result<Vec<UsageRecord>, CollectError> {
        let owner = inspector.key();
        let pods = self
            .store
            .list_instances(&owner)
            .await
            .map_err(CollectError::ListInstances)?;

        if pods.is_empty() {
            return Err(CollectError::NoInstancesFound);
        }

        let default_policy = default_policy(inspector);
        let names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
        let mut slots: Vec<Option<Result<InstanceUsage, CollectError>>> =
            (0..pods.len()).map(|_| None).collect();

        let mut tasks = JoinSet::new();
        for (slot, pod) in pods.into_iter().enumerate() {
            let client = Arc::clone(&self.client);
            let store = Arc::clone(&self.store);
            let policy = default_policy.clone();
            let timeout = self.config.probe_timeout;
            tasks.spawn(async move {
                let outcome = collect_instance(client, store, pod, policy, timeout).await;
                (slot, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((slot, outcome)) => slots[slot] = Some(outcome),
                Err(e) => debug!(error = %e, "Probe task did not complete"),
            }
        }

        let instance_count = names.len();
        let mut records = Vec::new();
        let mut failures = Vec::new();

        for (name, slot) in names.into_iter().zip(slots) {
            let outcome = slot.unwrap_or_else(|| {
                Err(CollectError::Task {
                    instance: name.clone(),
                    message: "task panicked or was cancelled".to_string(),
                })
            });

            match outcome {
                Ok(usage) if usage.records.is_empty() && !usage.errors.is_empty() => {
                    failures.push(CollectError::Volumes {
                        instance: name,
                        errors: JoinedErrors::new(usage.errors),
                    });
                }
                Ok(usage) => {
                    for err in &usage.errors {
                        warn!(pod = %name, error = %err, "Skipping pvc");
                    }
                    records.extend(usage.records);
                }
                Err(err) => failures.push(err),
            }
        }

        self.metrics.inc_probe_failures(failures.len() as u64);

        if failures.len() == instance_count {
            return Err(CollectError::AllInstancesFailed(JoinedErrors::new(
                failures,
            )));
        }

        for err in &failures {
            warn!(inspector = %owner, error = %err, "Dropping pod from disk usage pass");
        }
        debug!(
            inspector = %owner,
            pods = instance_count,
            failed = failures.len(),
            volumes = records.len(),
            "Collected disk usage"
        );

        Ok(records)
    }
}

/// Default policy of the inspector, if it has a valid one
fn default_policy(inspector: &PodDiskInspector) -> Option<ScalingPolicy> {
    let spec = inspector.spec.pvc_scaling.as_ref()?;
    match ScalingPolicy::try_from(spec) {
        Ok(policy) => Some(policy),
        Err(e) => {
            warn!(inspector = %inspector.key(), error = %e, "Ignoring invalid pvcScaling spec");
            None
        }
    }
}

/// Probe one pod and resolve every volume it reports
async fn collect_instance<C, S>(
    client: Arc<C>,
    store: Arc<S>,
    pod: Pod,
    default_policy: Option<ScalingPolicy>,
    timeout: Duration,
) -> Result<InstanceUsage, CollectError>
where
    C: UsageClient,
    S: ResourceStore,
{
    let instance = pod.name_any();
    let namespace = pod.namespace().unwrap_or_default();

    let pod_ip = pod
        .status
        .as_ref()
        .and_then(|s| s.pod_ip.as_deref())
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| CollectError::MissingAddress {
            instance: instance.clone(),
        })?;
    let address = probe_address(pod_ip);

    let entries = match tokio::time::timeout(timeout, client.disk_usage(&address)).await {
        Ok(Ok(entries)) => entries,
        Ok(Err(source)) => return Err(CollectError::Probe { instance, source }),
        Err(_) => {
            return Err(CollectError::Probe {
                instance,
                source: FetchError::Timeout(timeout),
            })
        }
    };

    let mut usage = InstanceUsage::default();
    for entry in entries {
        let key = ObjectKey::new(namespace.as_str(), entry.volume_name.as_str());
        let pvc = match store.get_volume(&key).await {
            Ok(pvc) => pvc,
            Err(source) => {
                usage.errors.push(CollectError::VolumeLookup {
                    key: key.to_string(),
                    source,
                });
                continue;
            }
        };

        match build_record(key, &entry, &pod, &pvc, default_policy.as_ref()) {
            Ok(record) => usage.records.push(record),
            Err(err) => usage.errors.push(err),
        }
    }

    Ok(usage)
}

fn build_record(
    key: ObjectKey,
    entry: &DiskUsageResponse,
    pod: &Pod,
    pvc: &PersistentVolumeClaim,
    default_policy: Option<&ScalingPolicy>,
) -> Result<UsageRecord, CollectError> {
    let capacity = pvc
        .status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get(STORAGE))
        .and_then(|q| StorageQuantity::try_from(q).ok())
        .ok_or_else(|| CollectError::MissingCapacity {
            key: key.to_string(),
        })?;

    let percent_used = entry
        .percent_used()
        .ok_or_else(|| CollectError::MissingCapacity {
            key: key.to_string(),
        })?;

    let requests = pvc
        .spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.clone())
        .unwrap_or_default();

    // Pod annotations first, PVC annotations take precedence
    let policy = default_policy.map(|p| resolve_policy(p, [pod.annotations(), pvc.annotations()]));

    Ok(UsageRecord {
        volume: VolumeSnapshot { key, requests },
        percent_used,
        capacity,
        policy,
    })
}
