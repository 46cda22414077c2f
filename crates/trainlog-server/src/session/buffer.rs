//! Per-session reading buffer.
//!
//! Readings, the dirty flag and the lifecycle state live behind one mutex so
//! that an append and the flush cycle's snapshot-and-clear never interleave.
//! The lock is only held for in-memory work; aggregation and disk writes
//! happen on the snapshot after it is released.

use serde::Serialize;
use tokio::sync::Mutex;
use trainlog_core::ingest::now;
use trainlog_core::{
    combine, CombinedReading, PositionReading, Reading, StepCountReading, Timestamp,
    TrainlogError, TrainlogResult,
};

/// Lifecycle of a session. Only ever moves from `Active` to `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Ended,
}

#[derive(Debug)]
struct BufferState {
    state: SessionState,
    started_at: Timestamp,
    ended_at: Option<Timestamp>,
    positions: Vec<PositionReading>,
    steps: Vec<StepCountReading>,
    /// Totals appended, unaffected by [`SessionBuffer::release`].
    position_count: usize,
    step_count: usize,
    dirty: bool,
}

/// Point-in-time copy of a session's readings.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub readings: Vec<CombinedReading>,
}

/// Summary of a buffer, used for status listings.
#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub state: SessionState,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
    pub positions: usize,
    pub step_counts: usize,
    pub dirty: bool,
}

/// Thread-safe reading buffer for one session.
#[derive(Debug)]
pub struct SessionBuffer {
    id: String,
    inner: Mutex<BufferState>,
}

impl SessionBuffer {
    /// Create an active, empty buffer.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: Mutex::new(BufferState {
                state: SessionState::Active,
                started_at: now(),
                ended_at: None,
                positions: Vec::new(),
                steps: Vec::new(),
                position_count: 0,
                step_count: 0,
                dirty: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append a reading. Fails with `InvalidState` once the session has ended.
    pub async fn append(&self, reading: Reading) -> TrainlogResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Ended {
            return Err(TrainlogError::InvalidState(format!(
                "session {} has ended",
                self.id
            )));
        }
        match reading {
            Reading::Position(p) => {
                inner.positions.push(p);
                inner.position_count += 1;
            }
            Reading::StepCount(s) => {
                inner.steps.push(s);
                inner.step_count += 1;
            }
        }
        inner.dirty = true;
        Ok(())
    }

    /// Snapshot the readings and clear the dirty flag, or `None` if nothing
    /// was appended since the last snapshot.
    pub async fn take_if_dirty(&self) -> Option<Snapshot> {
        let mut inner = self.inner.lock().await;
        if !inner.dirty {
            return None;
        }
        inner.dirty = false;
        Some(Snapshot {
            readings: combine(&inner.positions, &inner.steps),
        })
    }

    /// Snapshot the readings and clear the dirty flag unconditionally.
    pub async fn take(&self) -> Snapshot {
        let mut inner = self.inner.lock().await;
        inner.dirty = false;
        Snapshot {
            readings: combine(&inner.positions, &inner.steps),
        }
    }

    /// Set the dirty flag again after a failed write so the next tick retries.
    pub async fn mark_dirty(&self) {
        self.inner.lock().await.dirty = true;
    }

    /// Move to `Ended`. Returns `false` if the session had already ended.
    pub async fn close(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state == SessionState::Ended {
            return false;
        }
        inner.state = SessionState::Ended;
        inner.ended_at = Some(now());
        true
    }

    /// Drop the readings of an ended session whose data is all on disk.
    ///
    /// Returns `false` (and keeps everything) if the session is still active
    /// or has unflushed readings.
    pub async fn release(&self) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Ended || inner.dirty {
            return false;
        }
        inner.positions = Vec::new();
        inner.steps = Vec::new();
        true
    }

    pub async fn status(&self) -> BufferStatus {
        let inner = self.inner.lock().await;
        BufferStatus {
            state: inner.state,
            started_at: inner.started_at,
            ended_at: inner.ended_at,
            positions: inner.position_count,
            step_counts: inner.step_count,
            dirty: inner.dirty,
        }
    }
}
