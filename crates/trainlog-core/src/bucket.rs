//! Fixed-width time bucketing.
//!
//! Raw readings are grouped by `floor(t / width) * width` and each group is
//! reduced to one [`Bucket`]: positions are averaged, step counts take the
//! maximum. Buckets come out sorted by start time with no repeats.

use crate::reading::CombinedReading;
use std::collections::BTreeMap;
use std::num::NonZeroU32;

/// Default bucket width in seconds.
pub const DEFAULT_BUCKET_SECS: u32 = 10;

/// Largest timestamp magnitude, in seconds, that buckets exactly.
///
/// Every integer up to 2^53 is representable as `f64`, and the bucket start
/// of anything in this range fits an `i64` with room to spare.
pub const MAX_TIMESTAMP_SECS: f64 = 9_007_199_254_740_992.0;

/// One aggregated row of a session's series.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// Bucket start, in whole seconds.
    pub start: i64,
    pub avg_longitude: Option<f64>,
    pub avg_latitude: Option<f64>,
    /// Zero when the bucket holds no step counts.
    pub max_step_count: u64,
}

/// Running sums for a single bucket.
#[derive(Debug, Default)]
struct Accumulator {
    lat_sum: f64,
    lat_n: u32,
    long_sum: f64,
    long_n: u32,
    max_steps: Option<u64>,
}

impl Accumulator {
    fn observe(&mut self, r: &CombinedReading) {
        if let Some(lat) = r.latitude {
            self.lat_sum += lat;
            self.lat_n += 1;
        }
        if let Some(long) = r.longitude {
            self.long_sum += long;
            self.long_n += 1;
        }
        if let Some(count) = r.step_count {
            self.max_steps = Some(self.max_steps.map_or(count, |m| m.max(count)));
        }
    }

    fn finish(self, start: i64) -> Bucket {
        Bucket {
            start,
            avg_longitude: mean(self.long_sum, self.long_n),
            avg_latitude: mean(self.lat_sum, self.lat_n),
            max_step_count: self.max_steps.unwrap_or(0),
        }
    }
}

fn mean(sum: f64, n: u32) -> Option<f64> {
    (n > 0).then(|| sum / f64::from(n))
}

/// Start of the bucket that `timestamp` falls into.
///
/// Timestamps beyond [`MAX_TIMESTAMP_SECS`] are clamped to it; ingestion
/// rejects them before they reach a buffer.
pub fn bucket_start(timestamp: f64, width: NonZeroU32) -> i64 {
    let width = i64::from(width.get());
    let secs = timestamp
        .floor()
        .clamp(-MAX_TIMESTAMP_SECS, MAX_TIMESTAMP_SECS) as i64;
    secs.div_euclid(width) * width
}

/// Aggregate `readings` into buckets `width` seconds wide.
///
/// The result does not depend on the order of `readings`.
pub fn aggregate(readings: &[CombinedReading], width: NonZeroU32) -> Vec<Bucket> {
    let mut groups: BTreeMap<i64, Accumulator> = BTreeMap::new();
    for r in readings {
        groups
            .entry(bucket_start(r.timestamp, width))
            .or_default()
            .observe(r);
    }
    groups
        .into_iter()
        .map(|(start, acc)| acc.finish(start))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::Reading;

    fn width(secs: u32) -> NonZeroU32 {
        NonZeroU32::new(secs).unwrap()
    }

    fn combined(readings: &[Reading]) -> Vec<CombinedReading> {
        readings.iter().map(CombinedReading::from).collect()
    }

    #[test]
    fn positions_in_one_bucket_are_averaged() {
        let rows = combined(&[
            Reading::position(12.0, 1.0, 2.0),
            Reading::position(17.0, 3.0, 4.0),
        ]);
        let buckets = aggregate(&rows, width(10));
        assert_eq!(
            buckets,
            vec![Bucket {
                start: 10,
                avg_longitude: Some(3.0),
                avg_latitude: Some(2.0),
                max_step_count: 0,
            }]
        );
    }

    #[test]
    fn step_counts_take_the_max_not_the_last() {
        let rows = combined(&[Reading::step_count(5.0, 100), Reading::step_count(9.0, 80)]);
        let buckets = aggregate(&rows, width(10));
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].start, 0);
        assert_eq!(buckets[0].max_step_count, 100);
        assert_eq!(buckets[0].avg_latitude, None);
        assert_eq!(buckets[0].avg_longitude, None);
    }

    #[test]
    fn mixed_bucket_keeps_both_signals() {
        let rows = combined(&[
            Reading::step_count(21.0, 40),
            Reading::position(23.5, 5.0, 6.0),
            Reading::step_count(29.9, 55),
        ]);
        let buckets = aggregate(&rows, width(10));
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].start, 20);
        assert_eq!(buckets[0].avg_latitude, Some(5.0));
        assert_eq!(buckets[0].avg_longitude, Some(6.0));
        assert_eq!(buckets[0].max_step_count, 55);
    }

    #[test]
    fn buckets_sorted_regardless_of_arrival_order() {
        let rows = combined(&[
            Reading::position(45.0, 1.0, 1.0),
            Reading::step_count(3.0, 1),
            Reading::position(31.0, 2.0, 2.0),
            Reading::step_count(44.0, 9),
            Reading::position(1.0, 3.0, 3.0),
        ]);
        let starts: Vec<i64> = aggregate(&rows, width(10)).iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0, 30, 40]);

        let mut reversed = rows.clone();
        reversed.reverse();
        assert_eq!(aggregate(&rows, width(10)), aggregate(&reversed, width(10)));
    }

    #[test]
    fn fractional_and_boundary_timestamps() {
        assert_eq!(bucket_start(9.999, width(10)), 0);
        assert_eq!(bucket_start(10.0, width(10)), 10);
        assert_eq!(bucket_start(1_700_000_123.75, width(60)), 1_700_000_100);
    }

    #[test]
    fn negative_timestamps_floor_down() {
        assert_eq!(bucket_start(-0.5, width(10)), -10);
        assert_eq!(bucket_start(-10.0, width(10)), -10);
    }

    #[test]
    fn extreme_timestamps_do_not_overflow() {
        let w = width(u32::MAX);
        assert!(bucket_start(-1e300, w) <= -(MAX_TIMESTAMP_SECS as i64));
        assert!(bucket_start(1e300, w) <= MAX_TIMESTAMP_SECS as i64);
        assert_eq!(bucket_start(f64::NAN, width(10)), 0);

        let edge = MAX_TIMESTAMP_SECS as i64;
        assert_eq!(bucket_start(MAX_TIMESTAMP_SECS, width(10)), edge - edge % 10);
        assert_eq!(bucket_start(-MAX_TIMESTAMP_SECS, width(10)), -edge - (10 - edge % 10));
    }

    #[test]
    fn empty_input_yields_no_buckets() {
        assert!(aggregate(&[], width(10)).is_empty());
    }
}
