//! Error taxonomy for the collector, the resize engine and their collaborators
//!
//! Per-instance and per-volume failures are accumulated in [`JoinedErrors`]
//! instead of short-circuiting a pass.

use crate::policy::CapacityError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A lossless list of errors displayed one per line
#[derive(Debug)]
pub struct JoinedErrors<E>(Vec<E>);

impl<E> JoinedErrors<E> {
    pub fn new(errors: Vec<E>) -> Self {
        Self(errors)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, E> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<E> {
        self.0
    }
}

impl<E: fmt::Display> fmt::Display for JoinedErrors<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl<E: std::error::Error + 'static> std::error::Error for JoinedErrors<E> {}

/// Failure querying a disk probe. Always transient: the next pass retries.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("url parse: {0}")]
    InvalidAddress(#[from] url::ParseError),

    #[error("address {0:?} has no host")]
    MissingHost(String),

    #[error("http do: {0}")]
    Request(#[source] reqwest::Error),

    #[error("malformed json: {0}")]
    MalformedBody(#[source] serde_json::Error),

    #[error("no disk usage data")]
    NoUsableData,

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure talking to the resource store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("encode {kind}: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("pod cache: {0}")]
    Cache(#[from] kube::runtime::reflector::store::WriterDropped),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::NotFound { .. } => true,
            StoreError::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

/// Failure collecting disk usage for a PodDiskInspector
#[derive(Debug, Error)]
pub enum CollectError {
    #[error("list pods: {0}")]
    ListInstances(#[source] StoreError),

    #[error("no pods found")]
    NoInstancesFound,

    #[error("pod {instance} has no pod ip")]
    MissingAddress { instance: String },

    #[error("pod {instance}: {source}")]
    Probe {
        instance: String,
        #[source]
        source: FetchError,
    },

    #[error("pod {instance}: probe task failed: {message}")]
    Task { instance: String, message: String },

    #[error("get pvc {key}: {source}")]
    VolumeLookup {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("pvc {key} reports no usable storage capacity")]
    MissingCapacity { key: String },

    #[error("pod {instance}: {errors}")]
    Volumes {
        instance: String,
        errors: JoinedErrors<CollectError>,
    },

    #[error("{0}")]
    AllInstancesFailed(JoinedErrors<CollectError>),
}

/// Failure resizing a PVC or persisting the scaling history
#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("increaseQuantity must be a percentage string (e.g. 10%) or a storage quantity (e.g. 100Gi): pvc {volume}: {source}")]
    InvalidIncrease {
        volume: String,
        #[source]
        source: CapacityError,
    },

    #[error("patch pvc {volume} to {size}: {source}")]
    Patch {
        volume: String,
        size: String,
        #[source]
        source: StoreError,
    },

    #[error("get {resource}: {source}")]
    Refetch {
        resource: String,
        #[source]
        source: StoreError,
    },

    #[error("update status of {resource}: {source}")]
    PersistHistory {
        resource: String,
        #[source]
        source: StoreError,
    },

    #[error("{resource} no longer exists")]
    ResourceGone { resource: String },
}

impl ScaleError {
    /// True for errors that mean the resource was deleted mid-pass
    pub fn is_resource_gone(&self) -> bool {
        matches!(self, ScaleError::ResourceGone { .. })
    }
}
