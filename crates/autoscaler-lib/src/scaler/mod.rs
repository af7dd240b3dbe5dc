//! Resize decisions for collected disk usage
//!
//! The [`ResizeEngine`] turns usage records, their effective policies and the
//! persisted scaling history into capacity increase requests. Each PVC is
//! patched at most once per pass. Successful requests are merged into the
//! PodDiskInspector status after all records are processed.
//!
//! Patches are at-least-once. History bookkeeping is best-effort: a failure
//! to persist it is reported, but issued patches stay in effect.


use crate::collector::{UsageRecord, STORAGE};
use crate::crd::{ObjectKey, PodDiskInspector, PodDiskInspectorStatus, ScalingHistory, ScalingStatus};
use crate::error::{JoinedErrors, ScaleError};
use crate::observability::{AutoscalerMetrics, StructuredLogger};
use crate::policy::next_capacity;
use crate::quantity::StorageQuantity;
use crate::store::ResourceStore;
use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Source of the current time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Why a volume was left alone. Not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoPolicy,
    BelowThreshold { percent_used: i32, threshold: i32 },
    CeilingReached { max: StorageQuantity },
    Duplicate,
    AlreadyRequested { size: StorageQuantity },
    Cooldown { until: DateTime<Utc> },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoPolicy => write!(f, "no scaling policy"),
            SkipReason::BelowThreshold {
                percent_used,
                threshold,
            } => write!(f, "{}% used is below the {}% threshold", percent_used, threshold),
            SkipReason::CeilingReached { max } => write!(f, "max size {} reached", max),
            SkipReason::Duplicate => write!(f, "already handled in this pass"),
            SkipReason::AlreadyRequested { size } => write!(f, "{} already requested", size),
            SkipReason::Cooldown { until } => write!(f, "cooling down until {}", until.to_rfc3339()),
        }
    }
}

/// What a pass did
#[derive(Debug, Default)]
pub struct ResizeOutcome {
    /// Volumes patched in this pass
    pub patched: Vec<ObjectKey>,
    /// History as persisted, `None` when nothing was persisted
    pub history: Option<ScalingHistory>,
    /// Per-volume and persistence errors
    pub errors: Vec<ScaleError>,
}

impl ResizeOutcome {
    /// `Err` with every error joined, if there were any
    pub fn into_result(self) -> Result<Option<ScalingHistory>, JoinedErrors<ScaleError>> {
        if self.errors.is_empty() {
            Ok(self.history)
        } else {
            Err(JoinedErrors::new(self.errors))
        }
    }

    /// True if the managed resource disappeared while persisting history
    pub fn resource_gone(&self) -> bool {
        self.errors.iter().any(ScaleError::is_resource_gone)
    }
}

/// Decides and requests PVC capacity increases
pub struct ResizeEngine<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    metrics: AutoscalerMetrics,
    logger: StructuredLogger,
}

impl<S: ResourceStore> ResizeEngine<S> {
    pub fn new(store: Arc<S>, logger: StructuredLogger) -> Self {
        Self::with_clock(store, logger, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, logger: StructuredLogger, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            metrics: AutoscalerMetrics::new(),
            logger,
        }
    }

    /// Process one pass worth of records against `history`
    pub async fn process(
        &self,
        inspector: &PodDiskInspector,
        records: &[UsageRecord],
        history: &ScalingHistory,
    ) -> ResizeOutcome {
        let now = self.clock.now();
        let mut outcome = ResizeOutcome::default();
        let mut decided: HashSet<ObjectKey> = HashSet::new();
        let mut pending = ScalingHistory::new();

        for record in records {
            let target = match decide(record, history, &mut decided, now) {
                Ok(Decision::Resize(target)) => target,
                Ok(Decision::Skip(reason)) => {
                    debug!(pvc = %record.key(), reason = %reason, "Skipping pvc");
                    continue;
                }
                Err(err) => {
                    outcome.errors.push(err);
                    continue;
                }
            };

            let volume = record.key().to_string();
            let mut requests = record.volume.requests.clone();
            requests.insert(STORAGE.to_string(), target.to_k8s());

            match self
                .store
                .patch_volume_requests(record.key(), &requests)
                .await
            {
                Ok(()) => {
                    self.metrics.inc_patches_issued();
                    self.logger.log_patch_issued(
                        &volume,
                        record.percent_used,
                        &record.capacity.to_string(),
                        &target.to_string(),
                    );
                    outcome.patched.push(record.key().clone());
                    pending.insert(
                        volume,
                        ScalingStatus {
                            requested_size: target.to_k8s(),
                            requested_at: Time(now),
                        },
                    );
                }
                Err(source) => {
                    self.metrics.inc_patch_failures();
                    self.logger
                        .log_patch_failed(&volume, &target.to_string(), &source.to_string());
                    outcome.errors.push(ScaleError::Patch {
                        volume,
                        size: target.to_string(),
                        source,
                    });
                }
            }
        }

        if !pending.is_empty() {
            match self.persist_history(&inspector.key(), pending).await {
                Ok(history) => outcome.history = Some(history),
                Err(err) => outcome.errors.push(err),
            }
        }

        outcome
    }

    /// Re-read the resource and merge `pending` into its current history
    async fn persist_history(
        &self,
        key: &ObjectKey,
        pending: ScalingHistory,
    ) -> Result<ScalingHistory, ScaleError> {
        let resource = key.to_string();
        let mut latest = self
            .store
            .get_inspector(key)
            .await
            .map_err(|source| ScaleError::Refetch {
                resource: resource.clone(),
                source,
            })?
            .ok_or_else(|| ScaleError::ResourceGone {
                resource: resource.clone(),
            })?;

        let status = latest.status.get_or_insert_with(PodDiskInspectorStatus::default);
        let history = status.pvc_scaling_status.get_or_insert_with(ScalingHistory::new);
        merge_history(history, pending);
        let merged = history.clone();

        self.store
            .update_inspector_status(&latest)
            .await
            .map_err(|source| {
                if source.is_not_found() {
                    ScaleError::ResourceGone {
                        resource: resource.clone(),
                    }
                } else {
                    ScaleError::PersistHistory {
                        resource: resource.clone(),
                        source,
                    }
                }
            })?;

        self.logger.log_history_persisted(&resource, merged.len());
        Ok(merged)
    }
}

/// Merge `pending` into `history`, never lowering a recorded size
fn merge_history(history: &mut ScalingHistory, pending: ScalingHistory) {
    for (volume, status) in pending {
        let keep_existing = history.get(&volume).is_some_and(|existing| {
            match (
                StorageQuantity::try_from(&existing.requested_size),
                StorageQuantity::try_from(&status.requested_size),
            ) {
                (Ok(existing), Ok(new)) => existing > new,
                _ => false,
            }
        });
        if !keep_existing {
            history.insert(volume, status);
        }
    }
}

enum Decision {
    Resize(StorageQuantity),
    Skip(SkipReason),
}

/// Pure decision for one record
fn decide(
    record: &UsageRecord,
    history: &ScalingHistory,
    decided: &mut HashSet<ObjectKey>,
    now: DateTime<Utc>,
) -> Result<Decision, ScaleError> {
    let Some(policy) = record.policy.as_ref() else {
        return Ok(Decision::Skip(SkipReason::NoPolicy));
    };

    if record.percent_used < policy.used_space_percentage {
        return Ok(Decision::Skip(SkipReason::BelowThreshold {
            percent_used: record.percent_used,
            threshold: policy.used_space_percentage,
        }));
    }

    let mut target = next_capacity(&record.capacity, &policy.increase_quantity).map_err(
        |source| ScaleError::InvalidIncrease {
            volume: record.key().to_string(),
            source,
        },
    )?;

    if let Some(max) = policy.ceiling() {
        if record.capacity >= max {
            return Ok(Decision::Skip(SkipReason::CeilingReached { max }));
        }
        if target > max {
            // Keep the notation of the current size
            target = record.capacity.with_bytes(max.bytes());
        }
    }

    if !decided.insert(record.key().clone()) {
        return Ok(Decision::Skip(SkipReason::Duplicate));
    }

    if let Some(previous) = history.get(&record.key().to_string()) {
        // Requested sizes only grow
        if let Ok(requested) = StorageQuantity::try_from(&previous.requested_size) {
            if requested >= target {
                return Ok(Decision::Skip(SkipReason::AlreadyRequested { size: requested }));
            }
        }

        let until = chrono::Duration::from_std(policy.cooldown)
            .ok()
            .and_then(|cooldown| previous.requested_at.0.checked_add_signed(cooldown));
        match until {
            Some(until) if now < until => {
                return Ok(Decision::Skip(SkipReason::Cooldown { until }));
            }
            // Unrepresentable end of cooldown
            None => {
                return Ok(Decision::Skip(SkipReason::Cooldown {
                    until: DateTime::<Utc>::MAX_UTC,
                }));
            }
            Some(_) => {}
        }
    }

    Ok(Decision::Resize(target))
}
