//! Text layout of a persisted session series.
//!
//! One bucket per line: `start,avg_longitude,avg_latitude,max_step_count`.
//! Absent averages are empty fields. Lines are `\n`-joined with no header
//! and no trailing newline.

use crate::bucket::Bucket;
use std::fmt::Write;

/// File extension used for session artifacts.
pub const ARTIFACT_EXTENSION: &str = "csv";

fn push_optional(out: &mut String, value: Option<f64>) {
    if let Some(v) = value {
        // Debug keeps a trailing `.0` on integral values and switches to
        // exponent form (`1e-5`, `1e16`) outside [1e-4, 1e16).
        let _ = write!(out, "{v:?}");
    }
}

/// Render one bucket as an artifact line (without the newline).
pub fn encode_line(bucket: &Bucket) -> String {
    let mut line = bucket.start.to_string();
    line.push(',');
    push_optional(&mut line, bucket.avg_longitude);
    line.push(',');
    push_optional(&mut line, bucket.avg_latitude);
    line.push(',');
    line.push_str(&bucket.max_step_count.to_string());
    line
}

/// Render a whole bucketed series.
pub fn encode(buckets: &[Bucket]) -> String {
    buckets
        .iter()
        .map(encode_line)
        .collect::<Vec<_>>()
        .join("\n")
}
