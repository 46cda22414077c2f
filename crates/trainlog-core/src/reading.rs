//! Telemetry readings attached to a training session.
//!
//! Two kinds of readings arrive independently: GPS fixes and cumulative step
//! counts. Before bucketing they are flattened into [`CombinedReading`] rows
//! where the fields a reading does not carry are `None`.

/// Seconds since the Unix epoch, possibly fractional.
pub type Timestamp = f64;

/// A single GPS fix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionReading {
    pub timestamp: Timestamp,
    pub latitude: f64,
    pub longitude: f64,
}

/// A cumulative step count sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepCountReading {
    pub timestamp: Timestamp,
    pub count: u64,
}

/// Any reading a session can buffer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    Position(PositionReading),
    StepCount(StepCountReading),
}

impl Reading {
    pub fn position(timestamp: Timestamp, latitude: f64, longitude: f64) -> Self {
        Reading::Position(PositionReading {
            timestamp,
            latitude,
            longitude,
        })
    }

    pub fn step_count(timestamp: Timestamp, count: u64) -> Self {
        Reading::StepCount(StepCountReading { timestamp, count })
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Reading::Position(p) => p.timestamp,
            Reading::StepCount(s) => s.timestamp,
        }
    }
}

/// A reading annotated with every field the aggregated series carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CombinedReading {
    pub timestamp: Timestamp,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub step_count: Option<u64>,
}

impl From<&PositionReading> for CombinedReading {
    fn from(p: &PositionReading) -> Self {
        Self {
            timestamp: p.timestamp,
            latitude: Some(p.latitude),
            longitude: Some(p.longitude),
            step_count: None,
        }
    }
}

impl From<&StepCountReading> for CombinedReading {
    fn from(s: &StepCountReading) -> Self {
        Self {
            timestamp: s.timestamp,
            latitude: None,
            longitude: None,
            step_count: Some(s.count),
        }
    }
}

impl From<&Reading> for CombinedReading {
    fn from(r: &Reading) -> Self {
        match r {
            Reading::Position(p) => p.into(),
            Reading::StepCount(s) => s.into(),
        }
    }
}

/// Merge the two per-kind sequences into one combined sequence.
///
/// Order is positions first, then step counts; bucketing does not depend on it.
pub fn combine(positions: &[PositionReading], steps: &[StepCountReading]) -> Vec<CombinedReading> {
    let mut out = Vec::with_capacity(positions.len() + steps.len());
    out.extend(positions.iter().map(CombinedReading::from));
    out.extend(steps.iter().map(CombinedReading::from));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_marks_missing_fields() {
        let positions = [PositionReading {
            timestamp: 1.0,
            latitude: 10.0,
            longitude: 20.0,
        }];
        let steps = [StepCountReading {
            timestamp: 2.0,
            count: 7,
        }];
        let combined = combine(&positions, &steps);
        assert_eq!(combined.len(), 2);
        assert_eq!(combined[0].latitude, Some(10.0));
        assert_eq!(combined[0].step_count, None);
        assert_eq!(combined[1].latitude, None);
        assert_eq!(combined[1].longitude, None);
        assert_eq!(combined[1].step_count, Some(7));
    }

    #[test]
    fn reading_timestamp() {
        assert_eq!(Reading::position(3.5, 0.0, 0.0).timestamp(), 3.5);
        assert_eq!(Reading::step_count(9.0, 1).timestamp(), 9.0);
    }
}
