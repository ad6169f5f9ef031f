//! Human-readable size and duration grammar used by the configuration.
//!
//! Sizes accept `k/M/G/T` (decimal) and `ki/Mi/Gi/Ti` (binary) suffixes with
//! an optional trailing `B`. Durations accept `h/d/w/y` units, long forms
//! included (`hours`, `days`, ...). Both accept the literal `unlimited` where
//! the configuration allows it.

use crate::error::{Error, Result};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::time::Duration;
use time::{Date, OffsetDateTime};

/// Parse a human size string (`"100"`, `"1.5GiB"`, `"64M"`) to bytes.
pub fn parse_human_size(input: &str) -> Result<u64> {
    let s = input.trim();
    let digits_end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(digits_end);

    let quantity: f64 = number
        .parse()
        .map_err(|_| Error::InvalidSize(input.to_string()))?;

    let multiplier = match suffix.trim().trim_end_matches('B') {
        "" => 1.0,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return Err(Error::InvalidSize(input.to_string())),
    };

    let bytes = quantity * multiplier;
    if !bytes.is_finite() || bytes < 0.0 {
        return Err(Error::InvalidSize(input.to_string()));
    }
    Ok(bytes as u64)
}

/// A byte limit that may be unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeLimit(Option<u64>);

impl SizeLimit {
    pub const UNLIMITED: SizeLimit = SizeLimit(None);

    pub fn bytes(limit: u64) -> Self {
        Self(Some(limit))
    }

    pub fn limit(&self) -> Option<u64> {
        self.0
    }

    pub fn is_unlimited(&self) -> bool {
        self.0.is_none()
    }

    pub fn parse(input: &str) -> Result<Self> {
        if input.trim().eq_ignore_ascii_case("unlimited") {
            return Ok(Self::UNLIMITED);
        }
        parse_human_size(input).map(|bytes| Self(Some(bytes)))
    }
}

impl fmt::Display for SizeLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => write!(f, "unlimited"),
            Some(bytes) => write!(f, "{bytes}B"),
        }
    }
}

impl Serialize for SizeLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SizeLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

/// A duration limit that may be unlimited.
///
/// Hours, days and weeks are absolute durations. Years are calendar-relative:
/// the whole part advances the calendar year (clamping 29 February), the
/// fractional part adds nominal 365-day years.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DurationLimit {
    Unlimited,
    Fixed(Duration),
    Years(f64),
}

impl DurationLimit {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    pub fn parse(input: &str) -> Result<Self> {
        let s = input.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(Self::Unlimited);
        }

        let digits_end = s
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(s.len());
        let (number, unit) = s.split_at(digits_end);

        let quantity: f64 = number
            .parse()
            .map_err(|_| Error::InvalidDuration(input.to_string()))?;
        if !quantity.is_finite() || quantity < 0.0 {
            return Err(Error::InvalidDuration(input.to_string()));
        }

        const HOUR: f64 = 3600.0;
        match unit.trim().to_ascii_lowercase().as_str() {
            "h" | "hour" | "hours" => Ok(Self::Fixed(Duration::from_secs_f64(quantity * HOUR))),
            "d" | "day" | "days" => Ok(Self::Fixed(Duration::from_secs_f64(quantity * 24.0 * HOUR))),
            "w" | "week" | "weeks" => {
                Ok(Self::Fixed(Duration::from_secs_f64(quantity * 7.0 * 24.0 * HOUR)))
            }
            "y" | "year" | "years" => Ok(Self::Years(quantity)),
            _ => Err(Error::InvalidDuration(input.to_string())),
        }
    }

    /// The point at which something aged from `from` expires, or `None` when
    /// unlimited.
    pub fn expires_at(&self, from: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            Self::Unlimited => None,
            Self::Fixed(duration) => Some(from + *duration),
            Self::Years(years) => Some(add_years(from, *years)),
        }
    }

    /// The limit as an absolute duration, with years nominally 365 days, or
    /// `None` when unlimited.
    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Self::Unlimited => None,
            Self::Fixed(duration) => Some(*duration),
            Self::Years(years) => Some(Duration::from_secs_f64(years * 365.0 * 86400.0)),
        }
    }
}

impl fmt::Display for DurationLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::Fixed(duration) => write!(f, "{}h", duration.as_secs_f64() / 3600.0),
            Self::Years(years) => write!(f, "{years}y"),
        }
    }
}

impl Serialize for DurationLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for DurationLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(de::Error::custom)
    }
}

/// Add a possibly fractional number of calendar years to a timestamp.
fn add_years(from: OffsetDateTime, years: f64) -> OffsetDateTime {
    let whole = years.trunc() as i32;
    let fraction = years.fract();

    let date = from.date();
    let year = date.year() + whole;
    // 29 February clamps to 28 February in non-leap target years.
    let shifted = Date::from_calendar_date(year, date.month(), date.day())
        .or_else(|_| Date::from_calendar_date(year, date.month(), 28))
        .unwrap_or(date);

    from.replace_date(shifted) + Duration::from_secs_f64(fraction * 365.0 * 86400.0)
}
