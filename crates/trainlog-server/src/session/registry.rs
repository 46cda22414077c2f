//! Session lifecycle management.
//!
//! Maps session ids to their buffers and flush cycles, routes readings to one
//! session or broadcasts them to every active one, and ends sessions singly
//! or all at once.

use super::buffer::{BufferStatus, SessionBuffer};
use super::flush::{FlushCycle, FlushOutcome, FlushSettings, Flusher};
use crate::store::{validate_session_id, ArtifactStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::{self, JoinSet};
use tracing::{debug, info, warn};
use trainlog_core::ingest::{parse_position, parse_step_count};
use trainlog_core::{Reading, TrainlogError, TrainlogResult};

/// Where a GPS fix should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestTarget {
    /// A single named session.
    Session(String),
    /// Every session that is active when the fix arrives.
    Broadcast,
}

/// Information returned when listing sessions.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(flatten)]
    pub status: BufferStatus,
}

/// Outcome of ending every session.
#[derive(Debug, Default)]
pub struct EndAllReport {
    /// Sessions that this call moved to `Ended`.
    pub ended: Vec<String>,
    /// Sessions whose end failed, with the reason.
    pub failures: Vec<(String, TrainlogError)>,
}

/// One registered session: its buffer plus the flush cycle bound to it.
#[derive(Debug)]
struct SessionEntry {
    buffer: Arc<SessionBuffer>,
    flusher: Flusher,
    /// `None` once the cycle has been stopped.
    cycle: Mutex<Option<FlushCycle>>,
}

impl SessionEntry {
    /// End the session, waiting for its final flush.
    ///
    /// Returns `true` if this call performed the transition. Ending an ended
    /// session is a no-op unless its final flush failed, in which case the
    /// flush is retried.
    async fn end(&self) -> TrainlogResult<bool> {
        let mut cycle = self.cycle.lock().await;
        let performed = match cycle.take() {
            Some(c) => {
                self.buffer.close().await;
                c.stop().await?;
                true
            }
            None => {
                if let FlushOutcome::Written { buckets } = self.flusher.flush(false).await? {
                    info!(session_id = %self.buffer.id(), buckets, "retried final flush");
                }
                false
            }
        };
        self.buffer.release().await;
        Ok(performed)
    }

    /// Check that a new session may take over this entry's id.
    ///
    /// Only a fully ended session whose readings are all on disk can be
    /// replaced.
    async fn check_replaceable(&self) -> TrainlogResult<()> {
        let id = self.buffer.id();
        match self.cycle.try_lock() {
            // Held by an `end` that has not finished its final flush.
            Err(_) => return Err(TrainlogError::AlreadyExists(id.to_string())),
            Ok(cycle) if cycle.is_some() => {
                return Err(TrainlogError::AlreadyExists(id.to_string()))
            }
            Ok(_) => {}
        }
        if self.buffer.status().await.dirty {
            return Err(TrainlogError::InvalidState(format!(
                "session {id} ended with unflushed readings; end it again before restarting"
            )));
        }
        Ok(())
    }
}

/// Registry of all known sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    store: Arc<ArtifactStore>,
    settings: FlushSettings,
}

impl SessionRegistry {
    /// Create an empty registry writing artifacts into `store`.
    pub fn new(store: Arc<ArtifactStore>, settings: FlushSettings) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            settings,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    async fn lookup(&self, id: &str) -> TrainlogResult<Arc<SessionEntry>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TrainlogError::NotFound(id.to_string()))
    }

    async fn snapshot(&self) -> Vec<Arc<SessionEntry>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Start a session and its flush cycle.
    ///
    /// An ended session with the same id is replaced once its final flush
    /// has succeeded. An active or still-ending one is `AlreadyExists`; one
    /// whose final flush failed is `InvalidState`.
    pub async fn start(&self, id: &str) -> TrainlogResult<()> {
        validate_session_id(id)?;

        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.get(id) {
            existing.check_replaceable().await?;
            debug!(session_id = %id, "replacing ended session");
        }

        let buffer = Arc::new(SessionBuffer::new(id));
        let flusher = Flusher::new(buffer.clone(), self.store.clone(), &self.settings);
        let cycle = FlushCycle::spawn(flusher.clone(), self.settings.period);
        sessions.insert(
            id.to_string(),
            Arc::new(SessionEntry {
                buffer,
                flusher,
                cycle: Mutex::new(Some(cycle)),
            }),
        );

        info!(session_id = %id, "session started");
        Ok(())
    }

    /// End a session, blocking until its final flush completes.
    pub async fn end(&self, id: &str) -> TrainlogResult<()> {
        let entry = self.lookup(id).await?;
        if entry.end().await? {
            info!(session_id = %id, "session ended");
        }
        Ok(())
    }

    /// End every registered session.
    ///
    /// Sessions are ended concurrently and independently; one failure does not
    /// stop the others.
    pub async fn end_all(&self) -> EndAllReport {
        let mut tasks = JoinSet::new();
        let mut ids = HashMap::new();
        for entry in self.snapshot().await {
            let id = entry.buffer.id().to_string();
            let handle = tasks.spawn(async move { entry.end().await });
            ids.insert(handle.id(), id);
        }

        let report = collect_end_results(tasks, ids).await;
        info!(
            ended = report.ended.len(),
            failed = report.failures.len(),
            "ended all sessions"
        );
        report
    }

    /// Append a reading to one session.
    pub async fn append_to(&self, id: &str, reading: Reading) -> TrainlogResult<()> {
        self.lookup(id).await?.buffer.append(reading).await
    }

    /// Append a reading to every active session. Returns how many received it.
    ///
    /// A session that ends while the broadcast is in flight is skipped silently.
    pub async fn broadcast(&self, reading: Reading) -> usize {
        let mut delivered = 0;
        for entry in self.snapshot().await {
            if entry.buffer.append(reading).await.is_ok() {
                delivered += 1;
            }
        }
        debug!(delivered, "broadcast reading");
        delivered
    }

    /// Parse and ingest a GPS fix. Returns how many sessions received it.
    pub async fn append_gps(
        &self,
        target: IngestTarget,
        ts: Option<&str>,
        lat: &str,
        long: &str,
    ) -> TrainlogResult<usize> {
        let reading = parse_position(ts, lat, long)?;
        match target {
            IngestTarget::Session(id) => self.append_to(&id, reading).await.map(|()| 1),
            IngestTarget::Broadcast => Ok(self.broadcast(reading).await),
        }
    }

    /// Parse and ingest a step count for one session.
    pub async fn append_step_count(
        &self,
        id: &str,
        ts: Option<&str>,
        count: &str,
    ) -> TrainlogResult<()> {
        let reading = parse_step_count(ts, count)?;
        self.append_to(id, reading).await
    }

    /// List all registered sessions, sorted by id.
    pub async fn list(&self) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        for entry in self.snapshot().await {
            infos.push(SessionInfo {
                id: entry.buffer.id().to_string(),
                status: entry.buffer.status().await,
            });
        }
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}

/// Drain `tasks`, attributing each result to the session id it was spawned for.
async fn collect_end_results(
    mut tasks: JoinSet<TrainlogResult<bool>>,
    mut ids: HashMap<task::Id, String>,
) -> EndAllReport {
    let mut report = EndAllReport::default();
    while let Some(joined) = tasks.join_next_with_id().await {
        let (task_id, result) = match joined {
            Ok((task_id, result)) => (task_id, result),
            Err(e) => (
                e.id(),
                Err(TrainlogError::Other(format!("end task failed: {e}"))),
            ),
        };
        let id = ids.remove(&task_id).unwrap_or_default();
        match result {
            Ok(true) => report.ended.push(id),
            Ok(false) => {}
            Err(e) => {
                warn!(session_id = %id, error = %e, "failed to end session");
                report.failures.push((id, e));
            }
        }
    }
    report.ended.sort();
    report.failures.sort_by(|a, b| a.0.cmp(&b.0));
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::buffer::SessionState;
    use std::time::Duration;
    use tempfile::TempDir;

    fn registry(dir: &TempDir) -> Arc<SessionRegistry> {
        let store = Arc::new(ArtifactStore::open(dir.path()).unwrap());
        let settings = FlushSettings {
            period: Duration::from_secs(60),
            ..FlushSettings::default()
        };
        Arc::new(SessionRegistry::new(store, settings))
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.start("a").await.unwrap();
        assert!(matches!(
            reg.start("a").await,
            Err(TrainlogError::AlreadyExists(_))
        ));
        reg.end("a").await.unwrap();
        reg.start("a").await.unwrap();
        assert_eq!(reg.list().await.len(), 1);
        reg.end_all().await;
    }

    #[tokio::test]
    async fn bad_session_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        assert!(matches!(
            reg.start("../escape").await,
            Err(TrainlogError::InvalidSessionId(_))
        ));
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        assert!(matches!(reg.end("nope").await, Err(TrainlogError::NotFound(_))));
        assert!(matches!(
            reg.append_step_count("nope", Some("1"), "5").await,
            Err(TrainlogError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn append_after_end_is_invalid_state() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.start("a").await.unwrap();
        reg.end("a").await.unwrap();
        let err = reg
            .append_gps(IngestTarget::Session("a".into()), Some("1"), "1.0", "2.0")
            .await
            .unwrap_err();
        assert!(matches!(err, TrainlogError::InvalidState(_)));
        // Ending again is a no-op.
        reg.end("a").await.unwrap();
    }

    #[tokio::test]
    async fn parse_errors_do_not_touch_the_buffer() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.start("a").await.unwrap();
        reg.append_step_count("a", Some("1"), "10").await.unwrap();
        let err = reg.append_step_count("a", Some("2"), "ten").await.unwrap_err();
        assert!(matches!(err, TrainlogError::Parse(_)));
        let err = reg
            .append_gps(IngestTarget::Broadcast, None, "x", "1")
            .await
            .unwrap_err();
        assert!(matches!(err, TrainlogError::Parse(_)));

        let info = &reg.list().await[0];
        assert_eq!(info.status.step_counts, 1);
        assert_eq!(info.status.positions, 0);
        reg.end_all().await;
    }

    #[tokio::test]
    async fn end_flushes_everything_appended_before_it() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.start("run").await.unwrap();
        reg.append_gps(IngestTarget::Session("run".into()), Some("12"), "1.0", "2.0")
            .await
            .unwrap();
        reg.append_gps(IngestTarget::Session("run".into()), Some("17"), "3.0", "4.0")
            .await
            .unwrap();
        reg.append_step_count("run", Some("5"), "100").await.unwrap();
        reg.append_step_count("run", Some("9"), "80").await.unwrap();
        reg.end("run").await.unwrap();

        assert_eq!(
            reg.store().read("run").await.unwrap(),
            "0,,,100\n10,3.0,2.0,0"
        );
    }

    #[tokio::test]
    async fn broadcast_skips_ended_sessions() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        for id in ["a", "b", "c", "done"] {
            reg.start(id).await.unwrap();
        }
        reg.end("done").await.unwrap();
        let before = reg.store().read("done").await.unwrap();

        let delivered = reg
            .append_gps(IngestTarget::Broadcast, Some("3"), "10.0", "20.0")
            .await
            .unwrap();
        assert_eq!(delivered, 3);

        let report = reg.end_all().await;
        assert_eq!(report.ended, vec!["a", "b", "c"]);
        assert!(report.failures.is_empty());
        for id in ["a", "b", "c"] {
            assert_eq!(reg.store().read(id).await.unwrap(), "0,20.0,10.0,0");
        }
        assert_eq!(reg.store().read("done").await.unwrap(), before);
    }

    #[tokio::test]
    async fn end_all_collects_failures_and_ends_the_rest() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.start("good").await.unwrap();
        reg.start("bad").await.unwrap();
        reg.append_step_count("good", Some("1"), "1").await.unwrap();
        reg.append_step_count("bad", Some("1"), "1").await.unwrap();

        // A non-empty directory where the artifact should go makes the rename fail.
        let blocker = dir.path().join("bad.csv");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), "x").unwrap();

        let report = reg.end_all().await;
        assert_eq!(report.ended, vec!["good"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "bad");
        assert!(report.failures[0].1.is_persistence());
        assert_eq!(reg.store().read("good").await.unwrap(), "0,,,1");

        // The data is still buffered; clearing the blocker lets a retry succeed.
        std::fs::remove_dir_all(&blocker).unwrap();
        reg.end("bad").await.unwrap();
        assert_eq!(reg.store().read("bad").await.unwrap(), "0,,,1");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_end_and_end_all_do_not_deadlock() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        for i in 0..10 {
            reg.start(&format!("s{i}")).await.unwrap();
            reg.append_step_count(&format!("s{i}"), Some("1"), "1")
                .await
                .unwrap();
        }

        let mut tasks = JoinSet::new();
        for i in 0..10 {
            let reg = reg.clone();
            tasks.spawn(async move { reg.end(&format!("s{i}")).await.map(|_| ()) });
        }
        let sweep = {
            let reg = reg.clone();
            tokio::spawn(async move { reg.end_all().await })
        };

        let finished = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(res) = tasks.join_next().await {
                res.unwrap().unwrap();
            }
            sweep.await.unwrap()
        })
        .await
        .expect("end and end_all deadlocked");
        assert!(finished.failures.is_empty());

        for info in reg.list().await {
            assert_eq!(info.status.state, SessionState::Ended);
            assert_eq!(reg.store().read(&info.id).await.unwrap(), "0,,,1");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_appends_are_all_persisted() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::open(dir.path()).unwrap());
        let settings = FlushSettings {
            period: Duration::from_millis(5),
            ..FlushSettings::default()
        };
        let reg = Arc::new(SessionRegistry::new(store, settings));
        reg.start("busy").await.unwrap();

        let mut tasks = JoinSet::new();
        for worker in 0..4u64 {
            let reg = reg.clone();
            tasks.spawn(async move {
                for i in 0..100u64 {
                    // Worker w owns bucket w*10 and its counts climb to w*1000 + 99.
                    let ts = (worker * 10 + i % 10).to_string();
                    let count = (worker * 1000 + i).to_string();
                    reg.append_step_count("busy", Some(ts.as_str()), &count).await.unwrap();
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }
        reg.end("busy").await.unwrap();

        assert_eq!(
            reg.store().read("busy").await.unwrap(),
            "0,,,99\n10,,,1099\n20,,,2099\n30,,,3099"
        );
    }

    async fn entry(reg: &SessionRegistry, id: &str) -> Arc<SessionEntry> {
        reg.sessions.read().await.get(id).cloned().unwrap()
    }

    #[tokio::test]
    async fn restart_waits_for_an_end_in_progress() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.start("a").await.unwrap();

        // An `end` that has closed the buffer but not finished its final flush.
        let old = entry(&reg, "a").await;
        let guard = old.cycle.lock().await;
        old.buffer.close().await;
        assert!(matches!(
            reg.start("a").await,
            Err(TrainlogError::AlreadyExists(_))
        ));
        drop(guard);

        reg.end("a").await.unwrap();
        reg.start("a").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &entry(&reg, "a").await));
        reg.end_all().await;
    }

    #[tokio::test]
    async fn restart_over_unflushed_session_is_refused() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.start("a").await.unwrap();
        reg.append_step_count("a", Some("1"), "7").await.unwrap();

        let blocker = dir.path().join("a.csv");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), "x").unwrap();
        assert!(reg.end("a").await.unwrap_err().is_persistence());

        assert!(matches!(
            reg.start("a").await,
            Err(TrainlogError::InvalidState(_))
        ));

        std::fs::remove_dir_all(&blocker).unwrap();
        reg.end("a").await.unwrap();
        assert_eq!(reg.store().read("a").await.unwrap(), "0,,,7");
        reg.start("a").await.unwrap();
        reg.end_all().await;
    }

    #[tokio::test]
    async fn ended_session_releases_readings_but_keeps_counts() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.start("a").await.unwrap();
        reg.append_step_count("a", Some("1"), "7").await.unwrap();
        reg.append_gps(IngestTarget::Session("a".into()), Some("2"), "1.0", "2.0")
            .await
            .unwrap();
        reg.end("a").await.unwrap();

        assert!(entry(&reg, "a").await.buffer.take().await.readings.is_empty());
        let info = &reg.list().await[0];
        assert_eq!((info.status.positions, info.status.step_counts), (1, 1));
        assert_eq!(reg.store().read("a").await.unwrap(), "0,2.0,1.0,7");
    }

    #[tokio::test]
    async fn out_of_range_timestamp_is_rejected_and_session_still_ends() {
        let dir = TempDir::new().unwrap();
        let reg = registry(&dir);
        reg.start("run").await.unwrap();
        reg.append_step_count("run", Some("5"), "3").await.unwrap();
        for ts in ["-1e300", "1e19", "2e19"] {
            let err = reg
                .append_gps(IngestTarget::Broadcast, Some(ts), "1.0", "2.0")
                .await
                .unwrap_err();
            assert!(matches!(err, TrainlogError::Parse(_)), "{ts}: {err:?}");
        }
        reg.end("run").await.unwrap();
        assert_eq!(reg.store().read("run").await.unwrap(), "0,,,3");
    }

    #[tokio::test]
    async fn failed_end_task_is_reported_under_its_session_id() {
        let mut tasks: JoinSet<TrainlogResult<bool>> = JoinSet::new();
        let mut ids = HashMap::new();
        ids.insert(tasks.spawn(async { Ok(true) }).id(), "fine".to_string());
        ids.insert(
            tasks.spawn(async { panic!("flush exploded") }).id(),
            "broken".to_string(),
        );
        ids.insert(tasks.spawn(async { Ok(false) }).id(), "already".to_string());

        let report = collect_end_results(tasks, ids).await;
        assert_eq!(report.ended, vec!["fine"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "broken");
        assert!(matches!(report.failures[0].1, TrainlogError::Other(_)));
    }
}
