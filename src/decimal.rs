//! Fixed-point decimal used for every value placed on chain
//!
//! Values arrive from compute adapters as decimal strings. They are parsed
//! once into [`Dec`] and serialized back as plain strings, both in JSON and
//! in the canonical binary encoding that gets signed.

use bigdecimal::{BigDecimal, Signed, Zero};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum DecError {
    #[error("invalid decimal string '{0}'")]
    Parse(String),

    #[error("log10 requires a strictly positive value, got {0}")]
    NonPositiveLog(String),

    #[error("value {0} is not representable as a finite decimal")]
    NonFinite(String),
}

// Digits of the mantissa an f64 can hold
const LEADING_DIGITS: usize = 17;

/// Arbitrary precision decimal, always finite
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Dec(BigDecimal);

impl Dec {
    pub fn zero() -> Self {
        Self(BigDecimal::zero())
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        self.0.is_positive()
    }

    /// Base-10 logarithm. Fails for values `<= 0` instead of producing a
    /// non-finite result.
    ///
    /// The value is `m * 10^-scale`, so the integer part of the result comes
    /// from the digit count of `m` and the scale, exactly. Only the leading
    /// digits of `m` go through `f64`.
    pub fn log10(&self) -> Result<Dec, DecError> {
        if !self.is_positive() {
            return Err(DecError::NonPositiveLog(self.to_string()));
        }
        let (mantissa, scale) = self.0.as_bigint_and_exponent();
        let digits = mantissa.to_string();
        let leading = &digits[..digits.len().min(LEADING_DIGITS)];
        let lead = leading
            .parse::<f64>()
            .map(|v| v / 10f64.powi(leading.len() as i32 - 1))
            .map_err(|_| DecError::NonFinite(self.to_string()))?;
        let exponent = (digits.len() as i64 - 1)
            .checked_sub(scale)
            .ok_or_else(|| DecError::NonFinite(self.to_string()))?;
        let fraction = Dec::from_f64(lead.log10())?;
        Ok(Dec(BigDecimal::from(exponent) + fraction.0))
    }

    /// Shortest round-trip representation of a finite float
    pub fn from_f64(value: f64) -> Result<Dec, DecError> {
        if !value.is_finite() {
            return Err(DecError::NonFinite(value.to_string()));
        }
        let repr = value.to_string();
        BigDecimal::from_str(&repr)
            .map(Dec)
            .map_err(|_| DecError::NonFinite(repr))
    }
}

impl FromStr for Dec {
    type Err = DecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(DecError::Parse(s.to_string()));
        }
        BigDecimal::from_str(trimmed)
            .map(Dec)
            .map_err(|_| DecError::Parse(s.to_string()))
    }
}

impl fmt::Display for Dec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Dec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Dec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Dec::from_str(&raw).map_err(serde::de::Error::custom)
    }
}
