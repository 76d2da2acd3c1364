//! # Time Axis Decoding
//!
//! Decodes CF-convention time coordinates (`"days since 2020-01-01"`) into
//! calendar timestamps. Only calendars equivalent to the proleptic Gregorian
//! calendar are supported; everything else is rejected when the grid loads so
//! that all time representations normalise to the same date type.

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};

/// Time units accepted in a CF `units` attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    /// Convert the time unit to a multiplier for seconds
    pub fn to_seconds_multiplier(&self) -> f64 {
        match self {
            TimeUnit::Seconds => 1.0,
            TimeUnit::Minutes => 60.0,
            TimeUnit::Hours => 3600.0,
            TimeUnit::Days => 86400.0,
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "seconds" | "second" | "secs" | "sec" | "s" => Some(TimeUnit::Seconds),
            "minutes" | "minute" | "mins" | "min" => Some(TimeUnit::Minutes),
            "hours" | "hour" | "hrs" | "hr" | "h" => Some(TimeUnit::Hours),
            "days" | "day" | "d" => Some(TimeUnit::Days),
            _ => None,
        }
    }
}

/// A decoded `"<unit> since <reference>"` time axis description
#[derive(Debug, Clone, PartialEq)]
pub struct TimeAxis {
    pub unit: TimeUnit,
    pub reference: NaiveDateTime,
}

const SUPPORTED_CALENDARS: [&str; 3] = ["standard", "gregorian", "proleptic_gregorian"];

impl TimeAxis {
    /// Parses the `units` and optional `calendar` attributes of a time coordinate.
    pub fn parse(units: &str, calendar: Option<&str>) -> PipelineResult<Self> {
        if let Some(cal) = calendar {
            let cal = cal.trim().to_lowercase();
            if !SUPPORTED_CALENDARS.contains(&cal.as_str()) {
                return Err(PipelineError::Load(format!(
                    "Unsupported calendar '{}' (supported: {})",
                    cal,
                    SUPPORTED_CALENDARS.join(", ")
                )));
            }
        }

        let (unit_str, reference_str) = units
            .split_once(" since ")
            .ok_or_else(|| PipelineError::Load(format!("Time units '{}' are not '<unit> since <date>'", units)))?;

        let unit = TimeUnit::parse(unit_str.trim())
            .ok_or_else(|| PipelineError::Load(format!("Unknown time unit '{}'", unit_str.trim())))?;
        let reference = parse_reference(reference_str.trim())?;

        Ok(TimeAxis { unit, reference })
    }

    /// Converts one offset value into a timestamp, rounded to the millisecond.
    pub fn decode(&self, value: f64) -> PipelineResult<NaiveDateTime> {
        if !value.is_finite() {
            return Err(PipelineError::Load(format!("Non-finite time value {}", value)));
        }
        let overflow = || PipelineError::Load(format!("Time value {} overflows the calendar", value));
        let millis = (value * self.unit.to_seconds_multiplier() * 1000.0).round();
        // `as i64` saturates, so out-of-range offsets must be caught first
        if millis.abs() >= i64::MAX as f64 {
            return Err(overflow());
        }
        let offset = TimeDelta::try_milliseconds(millis as i64).ok_or_else(overflow)?;
        self.reference.checked_add_signed(offset).ok_or_else(overflow)
    }

    pub fn decode_all(&self, values: &[f64]) -> PipelineResult<Vec<NaiveDateTime>> {
        values.iter().map(|v| self.decode(*v)).collect()
    }
}

fn parse_reference(s: &str) -> PipelineResult<NaiveDateTime> {
    let trimmed = s
        .trim_end_matches("UTC")
        .trim_end_matches('Z')
        .trim_end_matches("+00:00")
        .trim();

    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    for fmt in FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(dt);
        }
    }

    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| PipelineError::Load(format!("Unparseable time reference '{}'", s)))
}
