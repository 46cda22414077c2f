//! Parsing of raw ingestion fields into typed readings.
//!
//! Values arrive as text from the outer request layer. Anything that does not
//! parse as a finite number (or a non-negative integer for step counts) is
//! rejected here so that session buffers only ever hold valid readings.

use crate::bucket::MAX_TIMESTAMP_SECS;
use crate::error::{TrainlogError, TrainlogResult};
use crate::reading::{Reading, Timestamp};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as fractional Unix seconds.
pub fn now() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn parse_finite(field: &str, raw: &str) -> TrainlogResult<f64> {
    let value: f64 = raw
        .trim()
        .parse()
        .map_err(|_| TrainlogError::Parse(format!("{field}: not a number: {raw:?}")))?;
    if !value.is_finite() {
        return Err(TrainlogError::Parse(format!("{field}: not finite: {raw:?}")));
    }
    Ok(value)
}

/// Parse an optional timestamp, assigning the current time when absent.
///
/// An empty string counts as absent.
pub fn parse_timestamp(raw: Option<&str>) -> TrainlogResult<Timestamp> {
    match raw.map(str::trim) {
        None | Some("") => Ok(now()),
        Some(s) => {
            let ts = parse_finite("timestamp", s)?;
            if ts.abs() > MAX_TIMESTAMP_SECS {
                return Err(TrainlogError::Parse(format!(
                    "timestamp: out of range: {s:?}"
                )));
            }
            Ok(ts)
        }
    }
}

/// Parse the fields of a GPS fix.
pub fn parse_position(ts: Option<&str>, lat: &str, long: &str) -> TrainlogResult<Reading> {
    let latitude = parse_finite("latitude", lat)?;
    let longitude = parse_finite("longitude", long)?;
    let timestamp = parse_timestamp(ts)?;
    Ok(Reading::position(timestamp, latitude, longitude))
}

/// Parse the fields of a step count sample.
pub fn parse_step_count(ts: Option<&str>, count: &str) -> TrainlogResult<Reading> {
    let count: u64 = count
        .trim()
        .parse()
        .map_err(|_| TrainlogError::Parse(format!("count: not a non-negative integer: {count:?}")))?;
    let timestamp = parse_timestamp(ts)?;
    Ok(Reading::step_count(timestamp, count))
}
