//! HTTP handler run by the probe sidecar
//!
//! Serves `GET /disk` with one [`DiskUsageResponse`] per configured volume.
//! Responds 200 when every volume was read, 500 when any read failed or when
//! no volumes are configured. Failed entries carry `error` and no byte counts.

use super::{DiskUsageResponse, DISK_PATH};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Raw filesystem statistics in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Reads filesystem statistics for a path
pub trait FsStatter: Send + Sync {
    fn stat(&self, path: &Path) -> io::Result<FsUsage>;
}

/// `statvfs(2)` backed statter
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsStatter;

#[cfg(unix)]
impl FsStatter for StatvfsStatter {
    fn stat(&self, path: &Path) -> io::Result<FsUsage> {
        let stat = nix::sys::statvfs::statvfs(path).map_err(io::Error::from)?;
        let fragment = u64::from(stat.fragment_size());
        Ok(FsUsage {
            total_bytes: u64::from(stat.blocks()).saturating_mul(fragment),
            free_bytes: u64::from(stat.blocks_free()).saturating_mul(fragment),
        })
    }
}

#[cfg(not(unix))]
impl FsStatter for StatvfsStatter {
    fn stat(&self, _path: &Path) -> io::Result<FsUsage> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "statvfs is not available on this platform",
        ))
    }
}

/// Probe configuration shared by requests
#[derive(Clone)]
pub struct ProbeState {
    volumes: Vec<String>,
    mount: PathBuf,
    statter: Arc<dyn FsStatter>,
}

impl ProbeState {
    /// `volumes` is a comma separated list; duplicates and empty names are dropped
    pub fn new(volumes: &str, mount: impl Into<PathBuf>, statter: Arc<dyn FsStatter>) -> Self {
        let mut unique: Vec<String> = Vec::new();
        for name in volumes.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            if !unique.iter().any(|existing| existing == name) {
                unique.push(name.to_string());
            }
        }

        Self {
            volumes: unique,
            mount: mount.into(),
            statter,
        }
    }

    pub fn volumes(&self) -> &[String] {
        &self.volumes
    }

    /// Read every configured volume; the flag is false if any read failed
    pub fn read_all(&self) -> (Vec<DiskUsageResponse>, bool) {
        let mut all_ok = !self.volumes.is_empty();
        let mut responses = Vec::with_capacity(self.volumes.len());

        for volume in &self.volumes {
            let dir = self.mount.join(volume);
            let mut resp = DiskUsageResponse {
                dir: dir.to_string_lossy().into_owned(),
                volume_name: volume.clone(),
                ..Default::default()
            };

            match self.statter.stat(&dir) {
                Ok(usage) => {
                    resp.total_bytes = usage.total_bytes;
                    resp.free_bytes = usage.free_bytes;
                }
                Err(e) => {
                    debug!(dir = %resp.dir, error = %e, "Failed to read filesystem statistics");
                    resp.error = Some(e.to_string());
                    all_ok = false;
                }
            }
            responses.push(resp);
        }

        (responses, all_ok)
    }
}

async fn disk_usage(State(state): State<Arc<ProbeState>>) -> impl IntoResponse {
    let (responses, all_ok) = state.read_all();
    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(responses))
}

/// Create the probe router
pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route(DISK_PATH, get(disk_usage))
        .with_state(Arc::new(state))
}
