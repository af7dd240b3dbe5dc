//! Autoscaler configuration

use anyhow::Result;
use serde::Deserialize;
use std::time::Duration;

/// Autoscaler configuration, read from `AUTOSCALER_*` environment variables
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AutoscalerConfig {
    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Delay between two autoscaling passes for the same PodDiskInspector
    #[serde(default = "default_requeue_interval")]
    pub requeue_interval_secs: u64,

    /// Upper bound for a single disk probe request
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Name reported on events and used as the field manager
    #[serde(default = "default_controller_name")]
    pub controller_name: String,
}

fn default_api_port() -> u16 {
    8080
}

fn default_requeue_interval() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_controller_name() -> String {
    autoscaler_lib::crd::PVC_SCALING_CONTROLLER.to_string()
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            requeue_interval_secs: default_requeue_interval(),
            probe_timeout_secs: default_probe_timeout(),
            controller_name: default_controller_name(),
        }
    }
}

impl AutoscalerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        Self::from_source(config::Environment::with_prefix("AUTOSCALER"))
    }

    fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let config = config::Config::builder().add_source(source).build()?;
        Ok(config.try_deserialize()?)
    }

    pub fn requeue_interval(&self) -> Duration {
        Duration::from_secs(self.requeue_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
