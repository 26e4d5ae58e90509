pub mod drain;
pub mod resume;
pub mod status;
pub mod stop;
pub mod submit;

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use harvest_common::model::{HttpMethod, NewRequest};
use harvest_core::checkpoint::FileCheckpointStore;
use harvest_core::coordinator::{Coordinator, CoordinatorConfig};
use harvest_core::queue::InMemoryQueueStore;
use harvest_core::validator::Schema;

use crate::config::Config;
use crate::error::CliError;
use crate::fetcher::HttpFetcher;
use crate::sink::FileSink;

/// Build a fresh Coordinator rooted at `<data_dir>/<job_id>/`. Every CLI
/// invocation gets its own in-memory queue; only the checkpoint and sink
/// persist across invocations.
pub fn build_coordinator(config: &Config, job_id: &str) -> Arc<Coordinator> {
    let queue = Arc::new(InMemoryQueueStore::new());
    let checkpoint = Arc::new(FileCheckpointStore::new(checkpoint_dir(config)));
    let sink = Arc::new(FileSink::new(&config.data_dir));
    Coordinator::new(
        job_id.to_owned(),
        CoordinatorConfig::default(),
        queue,
        checkpoint,
        sink,
    )
}

pub fn checkpoint_dir(config: &Config) -> PathBuf {
    Path::new(&config.data_dir).join("checkpoints")
}

pub fn raw_checkpoint_store(config: &Config) -> FileCheckpointStore {
    FileCheckpointStore::new(checkpoint_dir(config))
}

/// Spawn `count` in-process `WorkerLoop`s fetching over plain HTTP(S),
/// returning once every one of them has registered and is polling.
pub fn spawn_workers(
    config: &Config,
    coordinator: Arc<Coordinator>,
) -> Vec<Arc<harvest_worker::WorkerLoop>> {
    let fetcher: Arc<dyn harvest_core::traits::Fetcher> =
        Arc::new(HttpFetcher::new(config.request_timeout.0));
    let signer = Arc::new(harvest_core::traits::IdentitySignatureProvider);

    (0..config.workers)
        .map(|i| {
            let worker_config = harvest_worker::WorkerLoopConfig {
                capacity: config.worker_capacity,
                poll_interval: config.poll_interval.0,
                heartbeat_interval: config.heartbeat_interval.0,
                rate_acquire_timeout: config.rate_acquire_timeout.0,
            };
            Arc::new(harvest_worker::WorkerLoop::new(
                format!("worker-{i}"),
                coordinator.clone(),
                fetcher.clone(),
                signer.clone(),
                worker_config,
            ))
        })
        .collect()
}

/// Read one URL per line from `path`, ignoring blank lines and `#`-prefixed
/// comments, building a `NewRequest` per line. A line may carry a method
/// prefix (`POST https://...`); bare URLs default to GET.
pub async fn read_url_file(path: &str) -> Result<Vec<NewRequest>, CliError> {
    let contents = tokio::fs::read_to_string(path).await?;
    let mut requests = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (method, url) = match line
            .split_once(char::is_whitespace)
            .and_then(|(m, rest)| HttpMethod::from_str(m).ok().map(|m| (m, rest.trim())))
        {
            Some(parsed) => parsed,
            None => (HttpMethod::GET, line),
        };
        requests.push(NewRequest {
            url: url.to_owned(),
            method,
            ..Default::default()
        });
    }
    Ok(requests)
}

pub async fn read_schema_file(path: &str) -> Result<Schema, CliError> {
    let contents = tokio::fs::read_to_string(path).await?;
    serde_json::from_str(&contents).map_err(|e| CliError::BadSchema(e.to_string()))
}

/// JSON-friendly projection of `StatusCounters` for CLI output.
#[derive(serde::Serialize)]
pub struct StatusView {
    pub job_id: String,
    pub pending: usize,
    pub leased: usize,
    pub dead: usize,
    pub completed: usize,
    pub live_workers: usize,
    pub dead_workers: usize,
    pub job_status: String,
}

impl From<&harvest_core::coordinator::StatusCounters> for StatusView {
    fn from(s: &harvest_core::coordinator::StatusCounters) -> Self {
        Self {
            job_id: s.job_id.clone(),
            pending: s.pending,
            leased: s.leased,
            dead: s.dead,
            completed: s.completed,
            live_workers: s.live_workers,
            dead_workers: s.dead_workers,
            job_status: format!("{:?}", s.job_status),
        }
    }
}
