//! Periodic flushing of a session buffer to its artifact.
//!
//! Every session gets one [`FlushCycle`] task. On each tick it snapshots the
//! buffer if anything changed, buckets the readings and rewrites the artifact.
//! Stopping the cycle performs one last unconditional flush and hands its
//! result back to the caller.

use super::buffer::SessionBuffer;
use crate::store::{joined, ArtifactStore};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use trainlog_core::{aggregate, artifact, TrainlogError, TrainlogResult, DEFAULT_BUCKET_SECS};

/// Timing and bucketing parameters shared by every session's flush cycle.
#[derive(Debug, Clone, Copy)]
pub struct FlushSettings {
    /// Time between ticks.
    pub period: Duration,
    /// Bucket width in seconds.
    pub bucket_width: NonZeroU32,
    /// Upper bound on a single artifact write.
    pub write_timeout: Duration,
}

impl Default for FlushSettings {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(20),
            bucket_width: NonZeroU32::new(DEFAULT_BUCKET_SECS).unwrap_or(NonZeroU32::MIN),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of one flush pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// The artifact was rewritten with this many buckets.
    Written { buckets: usize },
    /// Nothing changed since the last flush; no I/O was done.
    Skipped,
}

type WriteSlot = Option<JoinHandle<TrainlogResult<()>>>;

/// Drains one session buffer into its artifact.
#[derive(Debug, Clone)]
pub struct Flusher {
    buffer: Arc<SessionBuffer>,
    store: Arc<ArtifactStore>,
    bucket_width: NonZeroU32,
    write_timeout: Duration,
    /// The session's last write, kept while it outlives its timeout.
    in_flight: Arc<Mutex<WriteSlot>>,
}

impl Flusher {
    pub fn new(buffer: Arc<SessionBuffer>, store: Arc<ArtifactStore>, settings: &FlushSettings) -> Self {
        Self {
            buffer,
            store,
            bucket_width: settings.bucket_width,
            write_timeout: settings.write_timeout,
            in_flight: Arc::new(Mutex::new(None)),
        }
    }

    /// Run one flush pass.
    ///
    /// Without `force`, a clean buffer is skipped. On a failed or timed-out
    /// write the buffer is marked dirty again so a later pass retries.
    /// Writes for one session never overlap: a write that timed out is
    /// awaited before the next one starts.
    pub async fn flush(&self, force: bool) -> TrainlogResult<FlushOutcome> {
        let snapshot = if force {
            self.buffer.take().await
        } else {
            match self.buffer.take_if_dirty().await {
                Some(s) => s,
                None => return Ok(FlushOutcome::Skipped),
            }
        };

        let buckets = aggregate(&snapshot.readings, self.bucket_width);
        let text = artifact::encode(&buckets);
        let id = self.buffer.id();

        let mut slot = self.in_flight.lock().await;
        let write = write_after_previous(&mut slot, &self.store, id, text);
        let result = match time::timeout(self.write_timeout, write).await {
            Ok(r) => r,
            Err(_) => Err(TrainlogError::Timeout),
        };
        drop(slot);

        match result {
            Ok(()) => Ok(FlushOutcome::Written {
                buckets: buckets.len(),
            }),
            Err(e) => {
                self.buffer.mark_dirty().await;
                Err(e)
            }
        }
    }
}

/// Wait out any earlier write still in `slot`, then write `text`.
///
/// The handle stays in `slot` until it completes, so cancelling this future
/// leaves the write visible to the next caller.
async fn write_after_previous(
    slot: &mut WriteSlot,
    store: &ArtifactStore,
    id: &str,
    text: String,
) -> TrainlogResult<()> {
    if let Some(previous) = slot.as_mut() {
        // Superseded by this write; only its completion matters.
        let _ = previous.await;
        *slot = None;
    }
    let handle = slot.insert(store.spawn_write(id, text));
    let result = handle.await;
    *slot = None;
    joined(result)
}

/// Handle to a running flush task.
#[derive(Debug)]
pub struct FlushCycle {
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<TrainlogResult<FlushOutcome>>,
}

impl FlushCycle {
    /// Start ticking every `period`. The first tick fires one period from now.
    pub fn spawn(flusher: Flusher, period: Duration) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(run(flusher, period, stop_rx));
        Self { stop_tx, handle }
    }

    /// Stop the cycle and wait for its final flush.
    ///
    /// A tick already in progress finishes before the final flush starts.
    pub async fn stop(self) -> TrainlogResult<FlushOutcome> {
        let _ = self.stop_tx.send(());
        self.handle
            .await
            .map_err(|e| TrainlogError::Other(format!("flush task failed: {e}")))?
    }
}

async fn run(
    flusher: Flusher,
    period: Duration,
    mut stop_rx: oneshot::Receiver<()>,
) -> TrainlogResult<FlushOutcome> {
    let session_id = flusher.buffer.id().to_string();
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await; // skip first immediate tick

    loop {
        tokio::select! {
            biased;
            // A dropped sender also stops the cycle.
            _ = &mut stop_rx => break,
            _ = ticker.tick() => match flusher.flush(false).await {
                Ok(FlushOutcome::Written { buckets }) => {
                    debug!(session_id = %session_id, buckets, "flushed");
                }
                Ok(FlushOutcome::Skipped) => {}
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "flush failed, will retry next tick");
                }
            },
        }
    }

    let outcome = flusher.flush(true).await;
    match &outcome {
        Ok(FlushOutcome::Written { buckets }) => {
            info!(session_id = %session_id, buckets, "final flush complete");
        }
        Ok(FlushOutcome::Skipped) => {}
        Err(e) => {
            error!(session_id = %session_id, error = %e, "final flush failed");
        }
    }
    outcome
}
