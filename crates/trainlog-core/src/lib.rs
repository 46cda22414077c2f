//! trainlog-core: Shared library for trainlog.
//!
//! Provides the telemetry reading model, boundary parsing of raw ingestion
//! fields, fixed-width time bucketing, and the artifact text layout.

pub mod artifact;
pub mod bucket;
pub mod error;
pub mod ingest;
pub mod reading;

// Re-export commonly used items at crate root.
pub use bucket::{aggregate, Bucket, DEFAULT_BUCKET_SECS};
pub use error::{TrainlogError, TrainlogResult};
pub use reading::{combine, CombinedReading, PositionReading, Reading, StepCountReading, Timestamp};
