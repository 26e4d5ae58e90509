//! Component #8: Checkpointer.
//!
//! Durable job progress so a restart resumes without repeating completed
//! work and without silently losing failures. Completions and failures are
//! appended to a write-ahead log; `snapshot` consolidates the WAL into a
//! single file via an atomic rename, so a reader never observes a
//! partially-written snapshot.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_common::model::JobStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint corrupt for job {0}: {1}")]
    Corrupt(String, String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSnapshot {
    pub job_id: String,
    pub total_requests: u64,
    pub completed: HashSet<Fingerprint>,
    pub failed: HashMap<Uuid, String>,
    pub last_persisted_at: DateTime<Utc>,
    pub status: JobStatus,
}

impl CheckpointSnapshot {
    pub fn new(job_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job_id.to_owned(),
            total_requests: 0,
            completed: HashSet::new(),
            failed: HashMap::new(),
            last_persisted_at: now,
            status: JobStatus::Running,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum WalEntry {
    Complete { fingerprint: Fingerprint },
    Failed { request_id: Uuid, reason: String },
    StatusChanged { status: JobStatus },
    TotalRequests { total: u64 },
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn mark_complete(&self, job_id: &str, fp: Fingerprint) -> Result<(), CheckpointError>;
    async fn mark_failed(
        &self,
        job_id: &str,
        request_id: Uuid,
        reason: String,
    ) -> Result<(), CheckpointError>;
    async fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), CheckpointError>;
    async fn set_total_requests(&self, job_id: &str, total: u64) -> Result<(), CheckpointError>;
    async fn load(&self, job_id: &str) -> Result<CheckpointSnapshot, CheckpointError>;
    async fn snapshot(&self, job_id: &str) -> Result<(), CheckpointError>;
}

/// Fast in-process implementation for tests and single-process use without
/// a restart-across-process requirement.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    snapshots: tokio::sync::Mutex<HashMap<String, CheckpointSnapshot>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn mark_complete(&self, job_id: &str, fp: Fingerprint) -> Result<(), CheckpointError> {
        let mut guard = self.snapshots.lock().await;
        let snap = guard
            .entry(job_id.to_owned())
            .or_insert_with(|| CheckpointSnapshot::new(job_id, Utc::now()));
        snap.completed.insert(fp);
        Ok(())
    }

    async fn mark_failed(
        &self,
        job_id: &str,
        request_id: Uuid,
        reason: String,
    ) -> Result<(), CheckpointError> {
        let mut guard = self.snapshots.lock().await;
        let snap = guard
            .entry(job_id.to_owned())
            .or_insert_with(|| CheckpointSnapshot::new(job_id, Utc::now()));
        snap.failed.insert(request_id, reason);
        Ok(())
    }

    async fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), CheckpointError> {
        let mut guard = self.snapshots.lock().await;
        let snap = guard
            .entry(job_id.to_owned())
            .or_insert_with(|| CheckpointSnapshot::new(job_id, Utc::now()));
        snap.status = status;
        Ok(())
    }

    async fn set_total_requests(&self, job_id: &str, total: u64) -> Result<(), CheckpointError> {
        let mut guard = self.snapshots.lock().await;
        let snap = guard
            .entry(job_id.to_owned())
            .or_insert_with(|| CheckpointSnapshot::new(job_id, Utc::now()));
        snap.total_requests = total;
        Ok(())
    }

    async fn load(&self, job_id: &str) -> Result<CheckpointSnapshot, CheckpointError> {
        let guard = self.snapshots.lock().await;
        Ok(guard
            .get(job_id)
            .cloned()
            .unwrap_or_else(|| CheckpointSnapshot::new(job_id, Utc::now())))
    }

    async fn snapshot(&self, _job_id: &str) -> Result<(), CheckpointError> {
        // Already durable (in-process memory); nothing to consolidate.
        Ok(())
    }
}

/// WAL + periodic-snapshot implementation backed by a directory on disk.
///
/// Layout per job: `<job_id>.snapshot.json` (latest consolidated state)
/// and `<job_id>.wal.jsonl` (append-only tail since that snapshot).
pub struct FileCheckpointStore {
    dir: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    fn snapshot_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.snapshot.json"))
    }

    fn wal_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.wal.jsonl"))
    }

    async fn append_entry(&self, job_id: &str, entry: &WalEntry) -> Result<(), CheckpointError> {
        use tokio::io::AsyncWriteExt;

        let _guard = self.lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let line = serde_json::to_string(entry)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.wal_path(job_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    /// Load the latest snapshot (if any) and replay the WAL tail on top of
    /// it, without touching the files on disk.
    async fn read_merged(&self, job_id: &str) -> Result<CheckpointSnapshot, CheckpointError> {
        let snapshot_path = self.snapshot_path(job_id);
        let mut snapshot = if snapshot_path.exists() {
            let bytes = tokio::fs::read(&snapshot_path).await?;
            serde_json::from_slice(&bytes).map_err(|e| {
                CheckpointError::Corrupt(job_id.to_owned(), e.to_string())
            })?
        } else {
            CheckpointSnapshot::new(job_id, Utc::now())
        };

        let wal_path = self.wal_path(job_id);
        if wal_path.exists() {
            let contents = tokio::fs::read_to_string(&wal_path).await?;
            for (line_no, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: WalEntry = serde_json::from_str(line).map_err(|e| {
                    CheckpointError::Corrupt(
                        job_id.to_owned(),
                        format!("wal line {line_no}: {e}"),
                    )
                })?;
                apply_entry(&mut snapshot, entry);
            }
        }

        Ok(snapshot)
    }

    async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), CheckpointError> {
        let tmp_path = path.with_extension("tmp");
        tokio::fs::write(&tmp_path, contents).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }
}

fn apply_entry(snapshot: &mut CheckpointSnapshot, entry: WalEntry) {
    match entry {
        WalEntry::Complete { fingerprint } => {
            snapshot.completed.insert(fingerprint);
        }
        WalEntry::Failed { request_id, reason } => {
            snapshot.failed.insert(request_id, reason);
        }
        WalEntry::StatusChanged { status } => {
            snapshot.status = status;
        }
        WalEntry::TotalRequests { total } => {
            snapshot.total_requests = total;
        }
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn mark_complete(&self, job_id: &str, fp: Fingerprint) -> Result<(), CheckpointError> {
        self.append_entry(job_id, &WalEntry::Complete { fingerprint: fp })
            .await
    }

    async fn mark_failed(
        &self,
        job_id: &str,
        request_id: Uuid,
        reason: String,
    ) -> Result<(), CheckpointError> {
        self.append_entry(job_id, &WalEntry::Failed { request_id, reason })
            .await
    }

    async fn set_status(&self, job_id: &str, status: JobStatus) -> Result<(), CheckpointError> {
        self.append_entry(job_id, &WalEntry::StatusChanged { status })
            .await
    }

    async fn set_total_requests(&self, job_id: &str, total: u64) -> Result<(), CheckpointError> {
        self.append_entry(job_id, &WalEntry::TotalRequests { total })
            .await
    }

    async fn load(&self, job_id: &str) -> Result<CheckpointSnapshot, CheckpointError> {
        self.read_merged(job_id).await
    }

    async fn snapshot(&self, job_id: &str) -> Result<(), CheckpointError> {
        let _guard = self.lock.lock().await;
        let mut merged = self.read_merged(job_id).await?;
        merged.last_persisted_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(&merged)?;
        Self::write_atomic(&self.snapshot_path(job_id), &bytes).await?;

        // Consolidated: truncate the WAL tail now that it is captured in
        // the snapshot. A fresh empty file replaces it atomically too.
        let wal_path = self.wal_path(job_id);
        if wal_path.exists() {
            Self::write_atomic(&wal_path, b"").await?;
        }
        Ok(())
    }
}
