//! PVC autoscaler library
//!
//! This crate provides the core functionality for:
//! - Storage quantity arithmetic and scaling policy resolution
//! - The PodDiskInspector custom resource
//! - The disk usage probe (wire model, client and HTTP handler)
//! - Concurrent disk usage collection and resize decisions
//! - Health checks and observability

pub mod collector;
pub mod crd;
pub mod error;
pub mod health;
pub mod observability;
pub mod policy;
pub mod probe;
pub mod quantity;
pub mod scaler;
pub mod store;

#[cfg(test)]
mod testing;

pub use collector::{CollectorConfig, UsageCollector, UsageRecord, VolumeSnapshot};
pub use crd::{ObjectKey, PodDiskInspector, PodDiskInspectorSpec, PodDiskInspectorStatus};
pub use error::{CollectError, FetchError, JoinedErrors, ScaleError, StoreError};
pub use health::{
    Component, ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use observability::{AutoscalerMetrics, StructuredLogger};
pub use policy::ScalingPolicy;
pub use quantity::StorageQuantity;
pub use scaler::{ResizeEngine, ResizeOutcome};
pub use store::{KubeStore, ResourceStore};
