//! PodDiskInspector custom resource and the annotation contract on pods
//!
//! The PodDiskInspector holds the default PVC scaling policy and, in its
//! status, the history of capacity requests issued for each PVC.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Annotation enabling autoscaling for a pod
pub const OPERATOR_ENABLED: &str = "pvc-autoscaler-operator.kubernetes.io/enabled";
/// Annotation naming the owning PodDiskInspector
pub const OPERATOR_NAME: &str = "pvc-autoscaler-operator.kubernetes.io/operator-name";
/// Annotation naming the owning PodDiskInspector's namespace
pub const OPERATOR_NAMESPACE: &str = "pvc-autoscaler-operator.kubernetes.io/operator-namespace";
/// Annotation carrying the probe sidecar image, read by the injector
pub const OPERATOR_IMAGE: &str = "pvc-autoscaler-operator.kubernetes.io/sidecar-image";

/// Canonical name of the PVC scaling controller
pub const PVC_SCALING_CONTROLLER: &str = "PVCScaling";

/// PodDiskInspector spec
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "autoscaler.allthatjazzleo",
    version = "v1alpha1",
    kind = "PodDiskInspector",
    plural = "poddiskinspectors",
    namespaced,
    status = "PodDiskInspectorStatus",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PodDiskInspectorSpec {
    /// Image for the disk probe sidecar, in "repository:tag" format
    pub image: String,

    /// Default scaling policy for every PVC of the matched pods
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_scaling: Option<PvcScalingSpec>,
}

/// Default PVC scaling policy
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcScalingSpec {
    /// Percentage of used disk space required to trigger scaling.
    /// With 80, scaling waits until used space reaches >=80% of capacity.
    pub used_space_percentage: i32,

    /// How much to increase the PVC's capacity: a percentage (e.g. 20%)
    /// or a storage quantity (e.g. 100Gi)
    pub increase_quantity: String,

    /// How long to wait before scaling again, e.g. "6h"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown: Option<String>,

    /// Once the capacity reaches this size autoscaling stops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_size: Option<Quantity>,
}

/// PodDiskInspector status
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodDiskInspectorStatus {
    /// Requests issued per PVC, keyed by "<namespace>/<name>"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pvc_scaling_status: Option<BTreeMap<String, ScalingStatus>>,
}

/// Last capacity request issued for a PVC
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingStatus {
    /// The PVC size requested by the controller
    pub requested_size: Quantity,
    /// When the controller requested the increase
    pub requested_at: Time,
}

/// Persisted scaling history, keyed by "<namespace>/<name>"
pub type ScalingHistory = BTreeMap<String, ScalingStatus>;

impl PodDiskInspector {
    /// Namespaced identity of this resource
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Persisted history, empty if none was recorded yet
    pub fn history(&self) -> ScalingHistory {
        self.status
            .as_ref()
            .and_then(|s| s.pvc_scaling_status.clone())
            .unwrap_or_default()
    }
}

/// Namespace and name of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Whether the annotations opt a pod into autoscaling
pub fn is_enabled(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(OPERATOR_ENABLED)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Index function mapping a pod's annotations to its owning PodDiskInspector
pub fn owner_key(annotations: &BTreeMap<String, String>) -> Option<ObjectKey> {
    let name = annotations.get(OPERATOR_NAME).filter(|v| !v.is_empty())?;
    let namespace = annotations.get(OPERATOR_NAMESPACE).filter(|v| !v.is_empty())?;
    Some(ObjectKey::new(namespace.as_str(), name.as_str()))
}
