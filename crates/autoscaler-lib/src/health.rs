//! Liveness and readiness of the autoscaler
//!
//! Every pass reports how collection and resizing went for one
//! PodDiskInspector, and the controller reports whether its watch loop is
//! running. A failed pass only degrades its component: the inspector is
//! requeued and retried. Liveness fails once the controller has stopped.
//! Readiness follows the controller alone.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Part of the autoscaler with its own health entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// Disk usage collection from the probes
    Collector,
    /// PVC resize requests and history bookkeeping
    Scaler,
    /// The PodDiskInspector watch loop
    Controller,
}

impl Component {
    pub const ALL: [Component; 3] = [Component::Collector, Component::Scaler, Component::Controller];
}

/// Health status of a component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Nothing reported yet
    Starting,
    /// The last pass touching this component failed
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Failed passes since the last successful one
    pub consecutive_failures: u32,
    pub updated_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn starting() -> Self {
        Self {
            status: ComponentStatus::Starting,
            message: None,
            consecutive_failures: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<Component, ComponentHealth>,
}

impl HealthResponse {
    /// True unless a component has failed for good
    pub fn is_live(&self) -> bool {
        self.status != ComponentStatus::Unhealthy
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared health state, cheap to clone
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<BTreeMap<Component, ComponentHealth>>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Every component starts out as `Starting`
    pub fn new() -> Self {
        let components = Component::ALL
            .into_iter()
            .map(|component| (component, ComponentHealth::starting()))
            .collect();
        Self {
            components: Arc::new(RwLock::new(components)),
        }
    }

    async fn set(&self, component: Component, status: ComponentStatus, message: Option<String>) {
        let mut components = self.components.write().await;
        let entry = components
            .entry(component)
            .or_insert_with(ComponentHealth::starting);
        entry.consecutive_failures = match status {
            ComponentStatus::Degraded => entry.consecutive_failures.saturating_add(1),
            _ => 0,
        };
        entry.status = status;
        entry.message = message;
        entry.updated_at = Utc::now();
    }

    /// A pass went through `component` without errors
    pub async fn pass_succeeded(&self, component: Component) {
        self.set(component, ComponentStatus::Healthy, None).await;
    }

    /// A pass failed in `component`
    pub async fn pass_failed(&self, component: Component, message: impl Into<String>) {
        self.set(component, ComponentStatus::Degraded, Some(message.into()))
            .await;
    }

    /// The watch loop is running
    pub async fn controller_started(&self) {
        self.set(Component::Controller, ComponentStatus::Healthy, None)
            .await;
    }

    /// The watch loop ended and will not come back
    pub async fn controller_stopped(&self, reason: impl Into<String>) {
        self.set(
            Component::Controller,
            ComponentStatus::Unhealthy,
            Some(reason.into()),
        )
        .await;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let components = self.components.read().await;
        let controller = components.get(&Component::Controller);

        let reason = match controller.map(|health| health.status) {
            Some(ComponentStatus::Healthy | ComponentStatus::Degraded) => None,
            Some(ComponentStatus::Unhealthy) => Some(format!(
                "controller stopped: {}",
                controller
                    .and_then(|health| health.message.as_deref())
                    .unwrap_or("unknown reason")
            )),
            Some(ComponentStatus::Starting) | None => {
                Some("controller not yet running".to_string())
            }
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
        }
    }
}
