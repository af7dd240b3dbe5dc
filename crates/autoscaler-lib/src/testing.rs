//! In-memory fakes for the probe client and the resource store

use crate::crd::{
    ObjectKey, PodDiskInspector, PodDiskInspectorSpec, PvcScalingSpec, OPERATOR_ENABLED,
    OPERATOR_NAME, OPERATOR_NAMESPACE,
};
use crate::error::{FetchError, StoreError};
use crate::probe::{probe_address, DiskUsageResponse, UsageClient};
use crate::store::ResourceStore;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, Pod,
    PodStatus, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

pub const NAMESPACE: &str = "default";
pub const INSPECTOR: &str = "inspector";

pub fn inspector(scaling: Option<PvcScalingSpec>) -> PodDiskInspector {
    let mut inspector = PodDiskInspector::new(
        INSPECTOR,
        PodDiskInspectorSpec {
            image: "disk-probe:latest".to_string(),
            pvc_scaling: scaling,
        },
    );
    inspector.metadata.namespace = Some(NAMESPACE.to_string());
    inspector
}

pub fn scaling_spec(threshold: i32, increase: &str, cooldown: &str, max: &str) -> PvcScalingSpec {
    PvcScalingSpec {
        used_space_percentage: threshold,
        increase_quantity: increase.to_string(),
        cooldown: Some(cooldown.to_string()),
        max_size: Some(Quantity(max.to_string())),
    }
}

/// An enabled pod owned by the test inspector
pub fn pod(name: &str, ip: Option<&str>, extra: &[(&str, &str)]) -> Pod {
    let mut annotations = BTreeMap::from([
        (OPERATOR_ENABLED.to_string(), "true".to_string()),
        (OPERATOR_NAME.to_string(), INSPECTOR.to_string()),
        (OPERATOR_NAMESPACE.to_string(), NAMESPACE.to_string()),
    ]);
    for (k, v) in extra {
        annotations.insert(k.to_string(), v.to_string());
    }

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            annotations: Some(annotations),
            ..Default::default()
        },
        status: Some(PodStatus {
            pod_ip: ip.map(str::to_string),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn pvc(name: &str, capacity: Option<&str>, annotations: &[(&str, &str)]) -> PersistentVolumeClaim {
    let storage = |q: &str| BTreeMap::from([("storage".to_string(), Quantity(q.to_string()))]);

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(NAMESPACE.to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            resources: Some(ResourceRequirements {
                requests: capacity.map(storage),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            capacity: capacity.map(storage),
            ..Default::default()
        }),
    }
}

pub fn usage(volume: &str, total: u64, free: u64) -> DiskUsageResponse {
    DiskUsageResponse {
        dir: format!("/mnt/{}", volume),
        volume_name: volume.to_string(),
        total_bytes: total,
        free_bytes: free,
        error: None,
    }
}

enum Reply {
    Usage(Vec<DiskUsageResponse>),
    Fail,
    Hang,
}

/// Probe client answering from a fixed table keyed by address
#[derive(Default)]
pub struct FakeUsageClient {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
}

impl FakeUsageClient {
    pub fn reply(self, ip: &str, entries: Vec<DiskUsageResponse>) -> Self {
        self.set(ip, Reply::Usage(entries))
    }

    pub fn fail(self, ip: &str) -> Self {
        self.set(ip, Reply::Fail)
    }

    /// Never answers
    pub fn hang(self, ip: &str) -> Self {
        self.set(ip, Reply::Hang)
    }

    fn set(self, ip: &str, reply: Reply) -> Self {
        self.replies
            .lock()
            .unwrap()
            .insert(probe_address(ip), reply);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl UsageClient for FakeUsageClient {
    async fn disk_usage(&self, address: &str) -> Result<Vec<DiskUsageResponse>, FetchError> {
        self.calls.lock().unwrap().push(address.to_string());
        let hang = {
            let replies = self.replies.lock().unwrap();
            match replies.get(address) {
                Some(Reply::Usage(entries)) => return Ok(entries.clone()),
                Some(Reply::Hang) => true,
                Some(Reply::Fail) | None => false,
            }
        };
        if hang {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Err(FetchError::NoUsableData)
    }
}

#[derive(Default)]
struct StoreState {
    pods: Vec<Pod>,
    pvcs: HashMap<ObjectKey, PersistentVolumeClaim>,
    inspector: Option<PodDiskInspector>,
    patches: Vec<(ObjectKey, BTreeMap<String, Quantity>)>,
    status_updates: Vec<PodDiskInspector>,
    failing_patches: HashSet<String>,
    fail_list: bool,
    fail_status: bool,
}

/// Resource store holding objects in memory and recording writes
#[derive(Default)]
pub struct FakeStore {
    state: Mutex<StoreState>,
}

impl FakeStore {
    pub fn with_pod(self, pod: Pod) -> Self {
        self.state.lock().unwrap().pods.push(pod);
        self
    }

    pub fn with_pvc(self, pvc: PersistentVolumeClaim) -> Self {
        let key = ObjectKey::new(
            pvc.metadata.namespace.clone().unwrap_or_default(),
            pvc.metadata.name.clone().unwrap_or_default(),
        );
        self.state.lock().unwrap().pvcs.insert(key, pvc);
        self
    }

    pub fn with_inspector(self, inspector: PodDiskInspector) -> Self {
        self.state.lock().unwrap().inspector = Some(inspector);
        self
    }

    pub fn failing_patch(self, pvc_name: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .failing_patches
            .insert(pvc_name.to_string());
        self
    }

    pub fn failing_list(self) -> Self {
        self.state.lock().unwrap().fail_list = true;
        self
    }

    pub fn failing_status(self) -> Self {
        self.state.lock().unwrap().fail_status = true;
        self
    }

    pub fn remove_inspector(&self) {
        self.state.lock().unwrap().inspector = None;
    }

    pub fn patches(&self) -> Vec<(ObjectKey, BTreeMap<String, Quantity>)> {
        self.state.lock().unwrap().patches.clone()
    }

    pub fn status_updates(&self) -> Vec<PodDiskInspector> {
        self.state.lock().unwrap().status_updates.clone()
    }

    pub fn inspector(&self) -> Option<PodDiskInspector> {
        self.state.lock().unwrap().inspector.clone()
    }
}

fn unavailable() -> StoreError {
    StoreError::Invalid("store unavailable".to_string())
}

#[async_trait]
impl ResourceStore for FakeStore {
    async fn list_instances(&self, owner: &ObjectKey) -> Result<Vec<Pod>, StoreError> {
        let state = self.state.lock().unwrap();
        if state.fail_list {
            return Err(unavailable());
        }
        Ok(state
            .pods
            .iter()
            .filter(|p| {
                p.metadata
                    .annotations
                    .as_ref()
                    .and_then(crate::crd::owner_key)
                    .as_ref()
                    == Some(owner)
            })
            .cloned()
            .collect())
    }

    async fn get_volume(&self, key: &ObjectKey) -> Result<PersistentVolumeClaim, StoreError> {
        self.state
            .lock()
            .unwrap()
            .pvcs
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "PersistentVolumeClaim",
                key: key.to_string(),
            })
    }

    async fn patch_volume_requests(
        &self,
        key: &ObjectKey,
        requests: &BTreeMap<String, Quantity>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_patches.contains(&key.name) {
            return Err(unavailable());
        }
        state.patches.push((key.clone(), requests.clone()));
        Ok(())
    }

    async fn get_inspector(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<PodDiskInspector>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .inspector
            .clone()
            .filter(|inspector| &inspector.key() == key))
    }

    async fn update_inspector_status(
        &self,
        inspector: &PodDiskInspector,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_status {
            return Err(unavailable());
        }
        state.status_updates.push(inspector.clone());
        state.inspector = Some(inspector.clone());
        Ok(())
    }
}
