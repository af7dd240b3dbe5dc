//! Scaling policy resolution and capacity arithmetic
//!
//! A [`ScalingPolicy`] starts from the managed resource's defaults and is then
//! refined by annotation overrides, first from the pod and then from the PVC.
//! Each override key has its own applier; a value that fails to parse leaves
//! the field as it was.

use crate::crd::PvcScalingSpec;
use crate::quantity::{QuantityError, StorageQuantity};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Annotation overriding the used space percentage threshold
pub const USED_SPACE_PERCENTAGE: &str = "pvc-autoscaler-operator.kubernetes.io/used-space-percentage";
/// Annotation overriding the increase quantity
pub const INCREASE_QUANTITY: &str = "pvc-autoscaler-operator.kubernetes.io/increase-quantity";
/// Annotation overriding the cooldown
pub const COOLDOWN: &str = "pvc-autoscaler-operator.kubernetes.io/cooldown";
/// Annotation overriding the maximum size
pub const MAX_SIZE: &str = "pvc-autoscaler-operator.kubernetes.io/max-size";

/// Errors building a policy from the managed resource spec
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid cooldown {value:?}: {source}")]
    Cooldown {
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("invalid maxSize {value:?}: {source}")]
    MaxSize {
        value: String,
        #[source]
        source: QuantityError,
    },
}

/// Errors computing the next capacity
#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("{spec:?} is neither a percentage nor a storage quantity: {source}")]
    Unparsable {
        spec: String,
        #[source]
        source: QuantityError,
    },

    #[error("increasing {current} by {spec:?} overflows")]
    Overflow {
        current: StorageQuantity,
        spec: String,
    },
}

/// Effective scaling policy for a single volume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingPolicy {
    /// Percentage of used space (inclusive) at which the volume grows
    pub used_space_percentage: i32,
    /// Either a percentage such as `20%` or a quantity such as `100Gi`
    pub increase_quantity: String,
    /// Minimum time between two requests for the same volume
    pub cooldown: Duration,
    /// Ceiling for the volume capacity; zero or absent means unbounded
    pub max_size: Option<StorageQuantity>,
}

impl ScalingPolicy {
    /// Maximum size if one is configured and nonzero
    pub fn ceiling(&self) -> Option<StorageQuantity> {
        self.max_size.filter(|max| !max.is_zero())
    }
}

impl TryFrom<&PvcScalingSpec> for ScalingPolicy {
    type Error = PolicyError;

    fn try_from(spec: &PvcScalingSpec) -> Result<Self, Self::Error> {
        let cooldown = match spec.cooldown.as_deref().filter(|s| !s.is_empty()) {
            Some(value) => parse_duration(value).map_err(|source| PolicyError::Cooldown {
                value: value.to_string(),
                source,
            })?,
            None => Duration::ZERO,
        };

        let max_size = spec
            .max_size
            .as_ref()
            .filter(|q| !q.0.is_empty())
            .map(|q| {
                StorageQuantity::try_from(q).map_err(|source| PolicyError::MaxSize {
                    value: q.0.clone(),
                    source,
                })
            })
            .transpose()?;

        Ok(Self {
            used_space_percentage: spec.used_space_percentage,
            increase_quantity: spec.increase_quantity.clone(),
            cooldown,
            max_size,
        })
    }
}

/// Parse a duration in the notation the resource persists, e.g. `10m`, `6h` or `1h30m0s`
pub fn parse_duration(value: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(value.trim())
}

/// Applies one override value to a policy, returning false if the value was rejected
type Applier = fn(&mut ScalingPolicy, &str) -> bool;

/// Override providers in the order they are consulted
const OVERRIDES: &[(&str, Applier)] = &[
    (USED_SPACE_PERCENTAGE, apply_used_space_percentage),
    (INCREASE_QUANTITY, apply_increase_quantity),
    (COOLDOWN, apply_cooldown),
    (MAX_SIZE, apply_max_size),
];

fn apply_used_space_percentage(policy: &mut ScalingPolicy, value: &str) -> bool {
    match value.trim().parse::<i32>() {
        Ok(percent) => {
            policy.used_space_percentage = percent;
            true
        }
        Err(_) => false,
    }
}

fn apply_increase_quantity(policy: &mut ScalingPolicy, value: &str) -> bool {
    policy.increase_quantity = value.to_string();
    true
}

fn apply_cooldown(policy: &mut ScalingPolicy, value: &str) -> bool {
    match parse_duration(value) {
        Ok(cooldown) => {
            policy.cooldown = cooldown;
            true
        }
        Err(_) => false,
    }
}

fn apply_max_size(policy: &mut ScalingPolicy, value: &str) -> bool {
    match StorageQuantity::parse(value.trim()) {
        Ok(max) => {
            policy.max_size = Some(max);
            true
        }
        Err(_) => false,
    }
}

/// Apply every recognised override found in `annotations`
pub fn apply_overrides(
    mut policy: ScalingPolicy,
    annotations: &BTreeMap<String, String>,
) -> ScalingPolicy {
    for (key, apply) in OVERRIDES {
        let Some(value) = annotations.get(*key).filter(|v| !v.is_empty()) else {
            continue;
        };
        if !apply(&mut policy, value) {
            tracing::debug!(annotation = %key, value = %value, "Ignoring unparsable policy override");
        }
    }
    policy
}

/// Fold override layers over the default policy, lowest precedence first
pub fn resolve_policy<'a, I>(default: &ScalingPolicy, layers: I) -> ScalingPolicy
where
    I: IntoIterator<Item = &'a BTreeMap<String, String>>,
{
    layers
        .into_iter()
        .fold(default.clone(), |policy, annotations| {
            apply_overrides(policy, annotations)
        })
}

/// Parse a percentage such as `20%`; bare numbers are not percentages
fn parse_percent(spec: &str) -> Option<i64> {
    let digits = spec.strip_suffix('%')?;
    digits.parse::<i64>().ok().filter(|p| *p >= 0)
}

/// Compute the capacity after one increase step
///
/// `increase` is tried as a percentage of `current` first and then as an
/// absolute quantity added to `current`. The result keeps the notation of
/// `current`.
pub fn next_capacity(
    current: &StorageQuantity,
    increase: &str,
) -> Result<StorageQuantity, CapacityError> {
    let overflow = || CapacityError::Overflow {
        current: *current,
        spec: increase.to_string(),
    };

    if let Some(percent) = parse_percent(increase) {
        // Round half away from zero on non-negative integers
        let scaled = i128::from(current.bytes()) * i128::from(percent);
        let additional = (scaled * 2 + 100) / 200;
        let bytes = i128::from(current.bytes()) + additional;
        let bytes = i64::try_from(bytes).map_err(|_| overflow())?;
        return Ok(current.with_bytes(bytes));
    }

    let additional =
        StorageQuantity::parse(increase).map_err(|source| CapacityError::Unparsable {
            spec: increase.to_string(),
            source,
        })?;
    current.checked_add(&additional).ok_or_else(overflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use proptest::prelude::*;

    const GI: i64 = 1 << 30;

    fn gi(n: i64) -> StorageQuantity {
        StorageQuantity::parse(&format!("{}Gi", n)).unwrap()
    }

    fn default_policy() -> ScalingPolicy {
        ScalingPolicy {
            used_space_percentage: 80,
            increase_quantity: "20%".to_string(),
            cooldown: Duration::from_secs(600),
            max_size: Some(gi(500)),
        }
    }

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_next_capacity_percentage() {
        assert_eq!(next_capacity(&gi(100), "20%").unwrap(), gi(120));
        assert_eq!(next_capacity(&gi(100), "10%").unwrap().to_string(), "110Gi");
    }

    #[test]
    fn test_next_capacity_quantity() {
        assert_eq!(next_capacity(&gi(100), "20Gi").unwrap(), gi(120));
        // A bare number is one byte, not one percent
        assert_eq!(next_capacity(&gi(100), "1").unwrap().bytes(), 100 * GI + 1);
    }

    #[test]
    fn test_next_capacity_rejects_garbage() {
        assert!(matches!(
            next_capacity(&gi(100), "not-a-spec"),
            Err(CapacityError::Unparsable { .. })
        ));
        assert!(next_capacity(&gi(100), "1.5%").is_err());
        assert!(next_capacity(&gi(100), "-10%").is_err());
        assert!(next_capacity(&gi(100), "").is_err());
    }

    #[test]
    fn test_next_capacity_rounds_half_up() {
        let current = StorageQuantity::parse("10").unwrap();
        // 10 * 25% = 2.5 -> 3
        assert_eq!(next_capacity(&current, "25%").unwrap().bytes(), 13);
        // 10 * 24% = 2.4 -> 2
        assert_eq!(next_capacity(&current, "24%").unwrap().bytes(), 12);
    }

    #[test]
    fn test_policy_from_spec() {
        let spec = PvcScalingSpec {
            used_space_percentage: 80,
            increase_quantity: "20%".to_string(),
            cooldown: Some("10m0s".to_string()),
            max_size: Some(Quantity("500Gi".to_string())),
        };
        let policy = ScalingPolicy::try_from(&spec).unwrap();
        assert_eq!(policy, default_policy());

        let unbounded = PvcScalingSpec {
            cooldown: None,
            max_size: None,
            ..spec.clone()
        };
        let policy = ScalingPolicy::try_from(&unbounded).unwrap();
        assert_eq!(policy.cooldown, Duration::ZERO);
        assert_eq!(policy.ceiling(), None);

        let broken = PvcScalingSpec {
            cooldown: Some("soon".to_string()),
            ..spec
        };
        assert!(matches!(
            ScalingPolicy::try_from(&broken),
            Err(PolicyError::Cooldown { .. })
        ));
    }

    #[test]
    fn test_zero_max_size_is_no_ceiling() {
        let policy = ScalingPolicy {
            max_size: Some(StorageQuantity::parse("0").unwrap()),
            ..default_policy()
        };
        assert_eq!(policy.ceiling(), None);
    }

    #[test]
    fn test_apply_overrides_all_keys() {
        let policy = apply_overrides(
            default_policy(),
            &annotations(&[
                (USED_SPACE_PERCENTAGE, "90"),
                (INCREASE_QUANTITY, "50Gi"),
                (COOLDOWN, "1h30m"),
                (MAX_SIZE, "1Ti"),
            ]),
        );
        assert_eq!(policy.used_space_percentage, 90);
        assert_eq!(policy.increase_quantity, "50Gi");
        assert_eq!(policy.cooldown, Duration::from_secs(5400));
        assert_eq!(policy.max_size, Some(StorageQuantity::parse("1Ti").unwrap()));
    }

    #[test]
    fn test_apply_overrides_ignores_malformed_and_unknown() {
        let policy = apply_overrides(
            default_policy(),
            &annotations(&[
                (USED_SPACE_PERCENTAGE, "lots"),
                (COOLDOWN, "whenever"),
                (MAX_SIZE, "huge"),
                (INCREASE_QUANTITY, ""),
                ("pvc-autoscaler-operator.kubernetes.io/unknown", "1"),
            ]),
        );
        assert_eq!(policy, default_policy());
    }

    #[test]
    fn test_resolve_policy_volume_wins_over_instance() {
        let pod = annotations(&[(USED_SPACE_PERCENTAGE, "70"), (INCREASE_QUANTITY, "10Gi")]);
        let pvc = annotations(&[(INCREASE_QUANTITY, "30%")]);

        let policy = resolve_policy(&default_policy(), [&pod, &pvc]);
        assert_eq!(policy.used_space_percentage, 70);
        assert_eq!(policy.increase_quantity, "30%");
        assert_eq!(policy.cooldown, Duration::from_secs(600));
    }

    proptest! {
        #[test]
        fn prop_percentage_increase(c in 0i64..(1 << 40), p in 1i64..=100) {
            let current = StorageQuantity::from_bytes(c, Default::default());
            let next = next_capacity(&current, &format!("{}%", p)).unwrap();
            let expected = c + ((c as f64) * (p as f64) / 100.0).round() as i64;
            prop_assert_eq!(next.bytes(), expected);
        }

        #[test]
        fn prop_absolute_increase(c in 0i64..(1 << 50), q in 0i64..(1 << 20)) {
            let current = StorageQuantity::from_bytes(c, Default::default());
            let next = next_capacity(&current, &format!("{}Ki", q)).unwrap();
            prop_assert_eq!(next.bytes(), c + q * 1024);
        }
    }
}
