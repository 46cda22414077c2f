//! Durable session artifacts.
//!
//! Each session owns one text file, `<data_dir>/<id>.csv`, fully rewritten on
//! every flush. Writes go to a fresh sibling temp file first and are renamed
//! into place, so a reader sees either the previous artifact or the new one.
//! Each write runs start to finish on one blocking task; dropping the caller's
//! future does not interrupt it.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tracing::debug;
use trainlog_core::artifact::ARTIFACT_EXTENSION;
use trainlog_core::{TrainlogError, TrainlogResult};

/// Check that `id` can be used as a file stem inside the data directory.
pub fn validate_session_id(id: &str) -> TrainlogResult<()> {
    let bad = id.is_empty()
        || id.starts_with('.')
        || id.contains(&['/', '\\', '\0'][..])
        || id.chars().any(char::is_whitespace);
    if bad {
        return Err(TrainlogError::InvalidSessionId(id.to_string()));
    }
    Ok(())
}

/// Directory of per-session artifacts.
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    tmp_seq: AtomicU64,
}

impl ArtifactStore {
    /// Open (creating if needed) the artifact directory.
    ///
    /// Temp files left behind by an interrupted process are removed.
    pub fn open(dir: impl Into<PathBuf>) -> TrainlogResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() && is_temp_file(&entry.file_name().to_string_lossy()) {
                debug!(path = %entry.path().display(), "removing stale temp file");
                std::fs::remove_file(entry.path())?;
            }
        }
        Ok(Self {
            dir,
            tmp_seq: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Artifact path for a session.
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{ARTIFACT_EXTENSION}"))
    }

    /// A temp path no other write will use.
    fn tmp_path_for(&self, id: &str) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{id}.{ARTIFACT_EXTENSION}.{seq}.tmp"))
    }

    /// Start replacing the session's artifact with `contents`.
    ///
    /// The write keeps running even if the returned handle is dropped.
    pub fn spawn_write(&self, id: &str, contents: String) -> JoinHandle<TrainlogResult<()>> {
        let tmp = self.tmp_path_for(id);
        let path = self.path_for(id);
        tokio::task::spawn_blocking(move || {
            if let Err(e) = write_atomic(&tmp, &path, contents.as_bytes()) {
                return Err(TrainlogError::Persistence(format!(
                    "{}: {e}",
                    path.display()
                )));
            }
            debug!(path = %path.display(), bytes = contents.len(), "artifact written");
            Ok(())
        })
    }

    /// Replace the session's artifact with `contents` and wait for it.
    pub async fn write(&self, id: &str, contents: &str) -> TrainlogResult<()> {
        joined(self.spawn_write(id, contents.to_string()).await)
    }

    /// Read a session's artifact.
    pub async fn read(&self, id: &str) -> TrainlogResult<String> {
        validate_session_id(id)?;
        match tokio::fs::read_to_string(self.path_for(id)).await {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TrainlogError::NotFound(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of all sessions that have an artifact, sorted.
    pub async fn list(&self) -> TrainlogResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ARTIFACT_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Flatten the result of a joined write task.
pub fn joined(
    result: Result<TrainlogResult<()>, tokio::task::JoinError>,
) -> TrainlogResult<()> {
    result.map_err(|e| TrainlogError::Persistence(format!("write task failed: {e}")))?
}

fn write_atomic(tmp: &Path, path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(tmp)?;
    let result = file.write_all(bytes).and_then(|()| file.sync_all());
    drop(file);
    let result = result.and_then(|()| std::fs::rename(tmp, path));
    if result.is_err() {
        let _ = std::fs::remove_file(tmp);
    }
    result
}

fn is_temp_file(name: &str) -> bool {
    name.ends_with(".tmp")
}
