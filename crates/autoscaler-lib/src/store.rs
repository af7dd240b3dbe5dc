//! Access to pods, PVCs and PodDiskInspectors
//!
//! [`ResourceStore`] is the seam between the autoscaling logic and the
//! Kubernetes API. [`KubeStore`] is the production implementation. It reads
//! pods from the reflector cache fed by the controller's pod watch and goes
//! to the API server for PVCs and PodDiskInspectors.

use crate::crd::{owner_key, ObjectKey, PodDiskInspector};
use crate::error::StoreError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::reflector::Store;
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

/// Read and write operations the collector and the resize engine rely on
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Pods whose owner annotations point at `owner`
    async fn list_instances(&self, owner: &ObjectKey) -> Result<Vec<Pod>, StoreError>;

    /// Fetch a PVC
    async fn get_volume(&self, key: &ObjectKey) -> Result<PersistentVolumeClaim, StoreError>;

    /// Merge-patch a PVC's `spec.resources.requests` with `requests`
    async fn patch_volume_requests(
        &self,
        key: &ObjectKey,
        requests: &BTreeMap<String, Quantity>,
    ) -> Result<(), StoreError>;

    /// Fetch a PodDiskInspector, `None` if it no longer exists
    async fn get_inspector(&self, key: &ObjectKey)
        -> Result<Option<PodDiskInspector>, StoreError>;

    /// Replace the status subresource of a PodDiskInspector
    async fn update_inspector_status(&self, inspector: &PodDiskInspector)
        -> Result<(), StoreError>;
}

/// Build the merge patch body replacing a PVC's resource requests
pub fn requests_patch(requests: &BTreeMap<String, Quantity>) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "resources": {
                "requests": requests,
            }
        }
    })
}

/// Cached pods whose owner annotations point at `owner`
pub fn cached_instances(pods: &Store<Pod>, owner: &ObjectKey) -> Vec<Pod> {
    pods.state()
        .into_iter()
        .filter(|pod| owner_key(pod.annotations()).as_ref() == Some(owner))
        .map(|pod| pod.as_ref().clone())
        .collect()
}

/// [`ResourceStore`] backed by the Kubernetes API and a pod cache
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    pods: Store<Pod>,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, pods: Store<Pod>, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            pods,
            field_manager: field_manager.into(),
        }
    }

    fn inspectors(&self, namespace: &str) -> Api<PodDiskInspector> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn list_instances(&self, owner: &ObjectKey) -> Result<Vec<Pod>, StoreError> {
        // Blocks until the pod watch has listed once
        self.pods.wait_until_ready().await?;
        let matched = cached_instances(&self.pods, owner);

        debug!(owner = %owner, pods = matched.len(), "Listed pods for inspector");
        Ok(matched)
    }

    async fn get_volume(&self, key: &ObjectKey) -> Result<PersistentVolumeClaim, StoreError> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &key.namespace);
        pvcs.get_opt(&key.name)
            .await?
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
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &key.namespace);
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        pvcs.patch(&key.name, &params, &Patch::Merge(requests_patch(requests)))
            .await?;
        Ok(())
    }

    async fn get_inspector(
        &self,
        key: &ObjectKey,
    ) -> Result<Option<PodDiskInspector>, StoreError> {
        Ok(self.inspectors(&key.namespace).get_opt(&key.name).await?)
    }

    async fn update_inspector_status(
        &self,
        inspector: &PodDiskInspector,
    ) -> Result<(), StoreError> {
        let namespace = inspector
            .namespace()
            .ok_or_else(|| StoreError::Invalid("PodDiskInspector has no namespace".to_string()))?;
        let body = serde_json::to_vec(inspector).map_err(|source| StoreError::Encode {
            kind: "PodDiskInspector",
            source,
        })?;

        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.inspectors(&namespace)
            .replace_status(&inspector.name_any(), &params, body)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{OPERATOR_NAME, OPERATOR_NAMESPACE};
    use crate::testing::{pod, INSPECTOR, NAMESPACE};
    use kube::runtime::reflector;
    use kube::runtime::watcher;

    #[tokio::test]
    async fn test_cached_instances_filters_by_owner() {
        let (pods, mut writer) = reflector::store::<Pod>();
        let other = pod("other-0", Some("10.0.0.3"), &[(OPERATOR_NAME, "elsewhere")]);
        let unowned = pod("orphan-0", None, &[(OPERATOR_NAMESPACE, "")]);
        writer.apply_watcher_event(&watcher::Event::Restarted(vec![
            pod("db-0", Some("10.0.0.1"), &[]),
            pod("db-1", Some("10.0.0.2"), &[]),
            other,
            unowned,
        ]));
        pods.wait_until_ready().await.unwrap();

        let owner = ObjectKey::new(NAMESPACE, INSPECTOR);
        let mut names: Vec<String> = cached_instances(&pods, &owner)
            .iter()
            .map(|pod| pod.name_any())
            .collect();
        names.sort();
        assert_eq!(names, vec!["db-0", "db-1"]);

        writer.apply_watcher_event(&watcher::Event::Deleted(pod("db-1", None, &[])));
        assert_eq!(cached_instances(&pods, &owner).len(), 1);
    }

    #[test]
    fn test_requests_patch_only_touches_requests() {
        let mut requests = BTreeMap::new();
        requests.insert("storage".to_string(), Quantity("120Gi".to_string()));
        requests.insert("example.com/iops".to_string(), Quantity("3000".to_string()));

        let patch = requests_patch(&requests);
        assert_eq!(patch["spec"]["resources"]["requests"]["storage"], "120Gi");
        assert_eq!(patch["spec"]["resources"]["requests"]["example.com/iops"], "3000");
        assert_eq!(patch.as_object().unwrap().len(), 1);
    }
}
