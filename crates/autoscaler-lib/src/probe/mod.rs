//! Disk usage probe
//!
//! Each autoscaled pod runs a probe sidecar that reports filesystem
//! statistics for its mounted PVCs over HTTP. This module provides:
//! - The wire model shared by the probe and its clients
//! - An HTTP client querying a pod's probe
//! - The probe's own HTTP handler

mod client;
pub mod server;

pub use client::HttpUsageClient;

use crate::error::FetchError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

/// Port the probe sidecar listens on
pub const PROBE_PORT: u16 = 1251;

/// Path serving disk usage statistics
pub const DISK_PATH: &str = "/disk";

/// Root under which the sidecar mounts each PVC, as `<root>/<pvc>`
pub const DEFAULT_MOUNT: &str = "/mnt";

/// Base address of the probe on a pod IP, bracketing IPv6 literals
pub fn probe_address(pod_ip: &str) -> String {
    match pod_ip.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("http://[{}]", ip),
        _ => format!("http://{}", pod_ip),
    }
}

/// Disk statistics in bytes for one mounted volume
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsageResponse {
    pub dir: String,
    #[serde(alias = "pvc_name")]
    pub volume_name: String,
    #[serde(default, alias = "all_bytes", skip_serializing_if = "is_zero")]
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub free_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl DiskUsageResponse {
    /// Entry reports real statistics: no error and a nonzero size
    pub fn is_usable(&self) -> bool {
        self.error.as_deref().map_or(true, str::is_empty) && self.total_bytes != 0
    }

    /// Used space as a whole percentage, rounded half up; `None` when the size is zero
    pub fn percent_used(&self) -> Option<i32> {
        if self.total_bytes == 0 {
            return None;
        }
        let total = u128::from(self.total_bytes);
        let used = total.saturating_sub(u128::from(self.free_bytes));
        let percent = (used * 200 + total) / (total * 2);
        i32::try_from(percent).ok()
    }
}

/// Queries a pod's disk probe
#[async_trait]
pub trait UsageClient: Send + Sync {
    /// Fetch usable disk statistics from the probe at `address` (scheme and
    /// host, without port)
    async fn disk_usage(&self, address: &str) -> Result<Vec<DiskUsageResponse>, FetchError>;
}

#[async_trait]
impl<T: UsageClient + ?Sized> UsageClient for Arc<T> {
    async fn disk_usage(&self, address: &str) -> Result<Vec<DiskUsageResponse>, FetchError> {
        (**self).disk_usage(address).await
    }
}
