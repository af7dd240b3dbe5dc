//! Storage quantities in the Kubernetes resource-quantity notation
//!
//! Parses strings such as `100Gi`, `500M`, `1.5Ti` or `1e9` into whole bytes
//! and formats byte counts back into canonical notation. Only the subset that
//! makes sense for volume capacities is supported: values are non-negative and
//! are rounded up to the next whole byte.

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Binary suffixes, largest first, with their power-of-two exponent
const BINARY_SUFFIXES: &[(&str, u32)] = &[
    ("Ei", 60),
    ("Pi", 50),
    ("Ti", 40),
    ("Gi", 30),
    ("Mi", 20),
    ("Ki", 10),
];

/// Decimal suffixes, largest first, with their power-of-ten exponent
const DECIMAL_SUFFIXES: &[(&str, i32)] = &[
    ("E", 18),
    ("P", 15),
    ("T", 12),
    ("G", 9),
    ("M", 6),
    ("k", 3),
    ("m", -3),
    ("u", -6),
    ("n", -9),
];

/// Errors returned when parsing a quantity string
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuantityError {
    #[error("quantity is empty")]
    Empty,

    #[error("quantities must match the regular expression '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$': {0:?}")]
    Malformed(String),

    #[error("unknown quantity suffix {suffix:?} in {input:?}")]
    UnknownSuffix { input: String, suffix: String },

    #[error("negative quantity {0:?} is not a storage size")]
    Negative(String),

    #[error("quantity {0:?} is too large")]
    Overflow(String),
}

/// Notation family a quantity was written in, kept so that derived values
/// are formatted the way the user wrote the original
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QuantityFormat {
    /// `Ki`, `Mi`, `Gi`, ...
    #[default]
    BinarySi,
    /// `k`, `M`, `G`, ... or no suffix
    DecimalSi,
    /// `1e9`, `5E3`, ...
    DecimalExponent,
}

/// A storage size in whole bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageQuantity {
    bytes: i64,
    format: QuantityFormat,
}

impl StorageQuantity {
    /// Create a quantity from a byte count
    pub fn from_bytes(bytes: i64, format: QuantityFormat) -> Self {
        Self {
            bytes: bytes.max(0),
            format,
        }
    }

    /// Parse a quantity string
    pub fn parse(input: &str) -> Result<Self, QuantityError> {
        parse_quantity(input)
    }

    /// Byte value
    pub fn bytes(&self) -> i64 {
        self.bytes
    }

    pub fn format(&self) -> QuantityFormat {
        self.format
    }

    pub fn is_zero(&self) -> bool {
        self.bytes == 0
    }

    /// Same notation family, different byte value
    pub fn with_bytes(&self, bytes: i64) -> Self {
        Self::from_bytes(bytes, self.format)
    }

    /// Add another quantity, keeping this quantity's notation
    pub fn checked_add(&self, other: &StorageQuantity) -> Option<Self> {
        self.bytes
            .checked_add(other.bytes)
            .map(|bytes| self.with_bytes(bytes))
    }

    /// Convert to the Kubernetes API representation
    pub fn to_k8s(&self) -> Quantity {
        Quantity(self.to_string())
    }
}

impl PartialEq for StorageQuantity {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for StorageQuantity {}

impl PartialOrd for StorageQuantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StorageQuantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl FromStr for StorageQuantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_quantity(s)
    }
}

impl TryFrom<&Quantity> for StorageQuantity {
    type Error = QuantityError;

    fn try_from(value: &Quantity) -> Result<Self, Self::Error> {
        parse_quantity(&value.0)
    }
}

impl From<StorageQuantity> for Quantity {
    fn from(value: StorageQuantity) -> Self {
        value.to_k8s()
    }
}

impl fmt::Display for StorageQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.bytes;
        if bytes == 0 {
            return write!(f, "0");
        }

        match self.format {
            QuantityFormat::BinarySi => {
                for (suffix, exp) in BINARY_SUFFIXES {
                    let unit = 1i64 << exp;
                    if bytes % unit == 0 {
                        return write!(f, "{}{}", bytes / unit, suffix);
                    }
                }
                write!(f, "{}", bytes)
            }
            QuantityFormat::DecimalSi => {
                for (suffix, exp) in DECIMAL_SUFFIXES.iter().filter(|(_, e)| *e > 0) {
                    let unit = 10i64.pow(*exp as u32);
                    if bytes % unit == 0 {
                        return write!(f, "{}{}", bytes / unit, suffix);
                    }
                }
                write!(f, "{}", bytes)
            }
            QuantityFormat::DecimalExponent => {
                let mut mantissa = bytes;
                let mut exp = 0;
                while mantissa % 1000 == 0 {
                    mantissa /= 1000;
                    exp += 3;
                }
                if exp == 0 {
                    write!(f, "{}", mantissa)
                } else {
                    write!(f, "{}e{}", mantissa, exp)
                }
            }
        }
    }
}

/// Scale factor expressed as numerator / denominator
struct Scale {
    num: u128,
    den: u128,
}

fn parse_quantity(input: &str) -> Result<StorageQuantity, QuantityError> {
    if input.is_empty() {
        return Err(QuantityError::Empty);
    }

    let (negative, rest) = match input.as_bytes()[0] {
        b'-' => (true, &input[1..]),
        b'+' => (false, &input[1..]),
        _ => (false, input),
    };

    let number_len = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(rest.len());
    let (number, suffix) = rest.split_at(number_len);

    let (int_part, frac_part) = match number.split_once('.') {
        Some((i, f)) => (i, f),
        None => (number, ""),
    };
    if (int_part.is_empty() && frac_part.is_empty()) || frac_part.contains('.') {
        return Err(QuantityError::Malformed(input.to_string()));
    }

    let (scale, format) = parse_suffix(input, suffix)?;

    let overflow = || QuantityError::Overflow(input.to_string());

    let mut mantissa: u128 = 0;
    for digit in int_part.bytes().chain(frac_part.bytes()) {
        mantissa = mantissa
            .checked_mul(10)
            .and_then(|m| m.checked_add(u128::from(digit - b'0')))
            .ok_or_else(overflow)?;
    }

    if negative && mantissa != 0 {
        return Err(QuantityError::Negative(input.to_string()));
    }

    let frac_den = 10u128
        .checked_pow(frac_part.len() as u32)
        .ok_or_else(overflow)?;
    let numerator = mantissa.checked_mul(scale.num).ok_or_else(overflow)?;
    let denominator = frac_den.checked_mul(scale.den).ok_or_else(overflow)?;

    // Round up to whole bytes
    let bytes = numerator / denominator + u128::from(numerator % denominator != 0);
    let bytes = i64::try_from(bytes).map_err(|_| overflow())?;

    Ok(StorageQuantity { bytes, format })
}

fn parse_suffix(input: &str, suffix: &str) -> Result<(Scale, QuantityFormat), QuantityError> {
    if suffix.is_empty() {
        return Ok((Scale { num: 1, den: 1 }, QuantityFormat::DecimalSi));
    }

    if let Some((_, exp)) = BINARY_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok((
            Scale {
                num: 1u128 << exp,
                den: 1,
            },
            QuantityFormat::BinarySi,
        ));
    }

    if let Some((_, exp)) = DECIMAL_SUFFIXES.iter().find(|(s, _)| *s == suffix) {
        return Ok((power_of_ten(input, *exp)?, QuantityFormat::DecimalSi));
    }

    // Decimal exponent such as e9 or E-3. A bare "E" is the exa suffix handled above.
    if let Some(exponent) = suffix.strip_prefix(['e', 'E']) {
        let exp: i32 = exponent
            .parse()
            .map_err(|_| QuantityError::Malformed(input.to_string()))?;
        return Ok((power_of_ten(input, exp)?, QuantityFormat::DecimalExponent));
    }

    Err(QuantityError::UnknownSuffix {
        input: input.to_string(),
        suffix: suffix.to_string(),
    })
}

fn power_of_ten(input: &str, exp: i32) -> Result<Scale, QuantityError> {
    let pow = 10u128
        .checked_pow(exp.unsigned_abs())
        .ok_or_else(|| QuantityError::Overflow(input.to_string()))?;
    Ok(if exp >= 0 {
        Scale { num: pow, den: 1 }
    } else {
        Scale { num: 1, den: pow }
    })
}
