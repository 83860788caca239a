//! Rate specification parsing.
//!
//! A rate is the minimum spacing between two admitted requests of one
//! principal. Tokens carry it in whichever shape the issuer supplied; this
//! module normalizes every shape into whole milliseconds.

use serde::{Deserialize, Serialize};
use serde_json::Number;
use std::fmt;

use crate::error::{GuardError, Result};

const NANOS_PER_MILLI: i64 = 1_000_000;

/// Largest millisecond count a fractional rate may resolve to.
const MAX_FRACTIONAL_MILLIS: f64 = 9_007_199_254_740_991.0;

/// Time unit accepted in a rate specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateUnit {
    Nanosecond,
    Millisecond,
    Second,
    Minute,
    Hour,
    Day,
    Week,
}

impl RateUnit {
    /// Resolve a unit suffix. The empty suffix means milliseconds.
    pub fn from_suffix(suffix: &str) -> Result<Self> {
        match suffix.to_ascii_lowercase().as_str() {
            "ns" => Ok(RateUnit::Nanosecond),
            "" | "ms" => Ok(RateUnit::Millisecond),
            "s" => Ok(RateUnit::Second),
            "m" => Ok(RateUnit::Minute),
            "h" => Ok(RateUnit::Hour),
            "d" => Ok(RateUnit::Day),
            "w" => Ok(RateUnit::Week),
            _ => Err(GuardError::InvalidRateUnit(suffix.to_string())),
        }
    }

    /// The canonical suffix for this unit.
    pub fn suffix(&self) -> &'static str {
        match self {
            RateUnit::Nanosecond => "ns",
            RateUnit::Millisecond => "ms",
            RateUnit::Second => "s",
            RateUnit::Minute => "m",
            RateUnit::Hour => "h",
            RateUnit::Day => "d",
            RateUnit::Week => "w",
        }
    }

    /// Convert a magnitude in this unit to milliseconds.
    ///
    /// Nanoseconds round up to the next whole millisecond. Returns `None` on
    /// overflow.
    pub fn to_millis(&self, value: i64) -> Option<i64> {
        match self {
            RateUnit::Nanosecond if value > 0 => Some((value - 1) / NANOS_PER_MILLI + 1),
            RateUnit::Nanosecond => Some(value / NANOS_PER_MILLI),
            RateUnit::Millisecond => Some(value),
            RateUnit::Second => value.checked_mul(1_000),
            RateUnit::Minute => value.checked_mul(60_000),
            RateUnit::Hour => value.checked_mul(3_600_000),
            RateUnit::Day => value.checked_mul(86_400_000),
            RateUnit::Week => value.checked_mul(604_800_000),
        }
    }

    /// Convert a fractional magnitude in this unit to milliseconds, without
    /// rounding except for nanoseconds, which round up as in [`to_millis`].
    ///
    /// [`to_millis`]: RateUnit::to_millis
    pub fn to_millis_f64(&self, value: f64) -> f64 {
        match self {
            RateUnit::Nanosecond => (value / NANOS_PER_MILLI as f64).ceil(),
            RateUnit::Millisecond => value,
            RateUnit::Second => value * 1_000.0,
            RateUnit::Minute => value * 60_000.0,
            RateUnit::Hour => value * 3_600_000.0,
            RateUnit::Day => value * 86_400_000.0,
            RateUnit::Week => value * 604_800_000.0,
        }
    }
}

impl fmt::Display for RateUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// A rate limit as carried inside a token.
///
/// Serialized untagged so a token payload holds exactly what the issuer
/// wrote: `100`, `"5s"` or `{"value": 5, "unit": "s"}`. Numeric magnitudes may
/// be fractional (`1500.5`, `{"value": 0.5, "unit": "s"}`); text magnitudes
/// are integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RateSpec {
    /// Plain milliseconds
    Millis(Number),
    /// Integer magnitude followed by an optional unit suffix, e.g. `"250 ms"`
    Text(String),
    /// Separate magnitude and unit
    Structured { value: Number, unit: String },
}

impl RateSpec {
    /// Build a structured rate from a magnitude and a known unit.
    pub fn structured(value: i64, unit: RateUnit) -> Self {
        RateSpec::Structured {
            value: Number::from(value),
            unit: unit.suffix().to_string(),
        }
    }

    /// Resolve this rate to milliseconds. See [`parse_rate`].
    pub fn to_millis(&self) -> Result<u64> {
        parse_rate(self)
    }
}

impl From<i64> for RateSpec {
    fn from(millis: i64) -> Self {
        RateSpec::Millis(Number::from(millis))
    }
}

impl From<&str> for RateSpec {
    fn from(text: &str) -> Self {
        RateSpec::Text(text.to_string())
    }
}

impl From<String> for RateSpec {
    fn from(text: String) -> Self {
        RateSpec::Text(text)
    }
}

impl fmt::Display for RateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSpec::Millis(ms) => write!(f, "{}ms", ms),
            RateSpec::Text(text) => f.write_str(text),
            RateSpec::Structured { value, unit } => write!(f, "{}{}", value, unit),
        }
    }
}

/// Convert a rate specification into a millisecond interval.
///
/// Fractional results of at least one millisecond round up to the next whole
/// millisecond. Fails with [`GuardError::InvalidRateUnit`] for an unknown
/// suffix and with [`GuardError::InvalidRateValue`] when the result is below
/// one millisecond.
pub fn parse_rate(spec: &RateSpec) -> Result<u64> {
    let millis = match spec {
        RateSpec::Millis(ms) => resolve(spec, ms, RateUnit::Millisecond)?,
        RateSpec::Text(text) => {
            let (magnitude, suffix) = split_text(text);
            let unit = RateUnit::from_suffix(suffix)?;
            let magnitude = magnitude.ok_or_else(|| {
                GuardError::InvalidRateValue(format!("no integer magnitude in {:?}", text))
            })?;
            convert(magnitude, unit)?
        }
        RateSpec::Structured { value, unit } => {
            resolve(spec, value, RateUnit::from_suffix(unit)?)?
        }
    };

    if millis < 1 {
        return Err(GuardError::InvalidRateValue(format!(
            "{} resolves to {}ms, must be at least 1ms",
            spec, millis
        )));
    }
    Ok(millis as u64)
}

/// Integers convert exactly; anything else goes through `f64`.
fn resolve(spec: &RateSpec, value: &Number, unit: RateUnit) -> Result<i64> {
    if let Some(whole) = value.as_i64() {
        return convert(whole, unit);
    }

    let millis = value
        .as_f64()
        .map(|fractional| unit.to_millis_f64(fractional))
        .unwrap_or(f64::NAN);
    if millis.is_nan() || millis > MAX_FRACTIONAL_MILLIS {
        return Err(GuardError::InvalidRateValue(format!(
            "{} overflows a millisecond count",
            spec
        )));
    }
    if millis < 1.0 {
        return Err(GuardError::InvalidRateValue(format!(
            "{} resolves to {}ms, must be at least 1ms",
            spec, millis
        )));
    }
    Ok(millis.ceil() as i64)
}

fn convert(value: i64, unit: RateUnit) -> Result<i64> {
    unit.to_millis(value).ok_or_else(|| {
        GuardError::InvalidRateValue(format!("{}{} overflows a millisecond count", value, unit))
    })
}

/// Split `" 250 ms "` into its leading integer and trailing alphabetic suffix.
fn split_text(text: &str) -> (Option<i64>, &str) {
    let trimmed = text.trim();
    let suffix_start = trimmed
        .trim_end_matches(|c: char| c.is_ascii_alphabetic())
        .len();
    (leading_integer(trimmed), &trimmed[suffix_start..])
}

fn leading_integer(text: &str) -> Option<i64> {
    let bytes = text.as_bytes();
    let mut end = 0;
    if matches!(bytes.first(), Some(b'+') | Some(b'-')) {
        end = 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return None;
    }
    text[..end].parse().ok()
}
