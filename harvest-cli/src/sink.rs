//! `FileSink`: append-only JSON-lines output, one line per completed
//! record, idempotent within a process lifetime via an in-memory
//! `(request_id, attempt)` dedup set. A real deployment would likely
//! sink into object storage or a warehouse; this is the reference
//! implementation for the single-process CLI.

use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use harvest_common::model::ResultRecord;
use harvest_core::traits::{Sink, SinkError};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct FileSink {
    dir: PathBuf,
    seen: Mutex<HashSet<(Uuid, u32)>>,
}

impl FileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seen: Mutex::new(HashSet::new()),
        }
    }

    fn path_for(&self, job_id: &str) -> PathBuf {
        self.dir.join(job_id).join("results.jsonl")
    }
}

#[async_trait]
impl Sink for FileSink {
    async fn write(&self, job_id: &str, record: &ResultRecord) -> Result<(), SinkError> {
        let key = (record.request_id, record.attempt);
        {
            let mut seen = self.seen.lock().await;
            if !seen.insert(key) {
                return Ok(());
            }
        }

        let path = self.path_for(job_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SinkError::Rejected(e.to_string()))?;
        }

        let line =
            serde_json::to_string(record).map_err(|e| SinkError::Rejected(e.to_string()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| SinkError::Rejected(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| SinkError::Rejected(e.to_string()))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| SinkError::Rejected(e.to_string()))?;
        file.flush().await.map_err(|e| SinkError::Rejected(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_common::model::ResultStatus;

    fn sample_record(id: Uuid) -> ResultRecord {
        ResultRecord {
            request_id: id,
            attempt: 0,
            status: ResultStatus::Success,
            http_status: Some(200),
            body: b"{}".to_vec(),
            elapsed_ms: 1,
            proxy_used: None,
            error_message: None,
            suspicious: false,
        }
    }

    #[tokio::test]
    async fn writes_are_appended_and_deduped_by_request_and_attempt() {
        let dir = std::env::temp_dir().join(format!("harvest-sink-test-{}", Uuid::now_v7()));
        let sink = FileSink::new(&dir);
        let record = sample_record(Uuid::now_v7());

        sink.write("job1", &record).await.unwrap();
        sink.write("job1", &record).await.unwrap();

        let contents = tokio::fs::read_to_string(dir.join("job1").join("results.jsonl"))
            .await
            .unwrap();
        assert_eq!(contents.lines().count(), 1);

        tokio::fs::remove_dir_all(&dir).await.ok();
    }
}
