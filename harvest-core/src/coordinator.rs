//! Component #10: Coordinator.
//!
//! Top-level glue: wires the nine other components, exposes
//! submit/status/drain/stop, and owns the background loops (reclamation,
//! snapshotting, feedback ticking), spawning independent tokio tasks from
//! the constructor the way a long-running worker process owns its own
//! background loops.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use harvest_common::model::{JobStatus, NewRequest, Request, WorkerStatus};
use harvest_common::retry::RetryPolicy;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::dispatcher::{Disposition, Dispatcher, DispatcherError};
use crate::feedback::{Adjustment, FeedbackController, Thresholds};
use crate::fingerprint::{self, DedupOutcome, FingerprintRegistry};
use crate::proxy::ProxyPool;
use crate::queue::{QueueError, QueueStore};
use crate::rate::RateGate;
use crate::registry::{RegistryError, WorkerRegistry};
use crate::traits::Sink;
use crate::validator::{Schema, Validator};
use harvest_common::model::{ResultRecord, Task};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("invalid request: {0}")]
    InvalidRequest(#[from] harvest_common::model::InvalidRequestError),
    #[error("job is not accepting submissions (draining or stopped)")]
    JobNotAccepting,
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Dispatcher(#[from] DispatcherError),
    #[error("checkpoint corrupt: {0}")]
    CheckpointCorrupt(String),
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub lease_timeout: StdDuration,
    pub reclaim_tick: StdDuration,
    pub snapshot_interval: StdDuration,
    pub feedback_tick: StdDuration,
    pub heartbeat_timeout: chrono::Duration,
    pub default_rate_per_sec: f64,
    pub default_capacity: f64,
    pub proxy_ban_duration: StdDuration,
    pub bloom_expected_items: usize,
    pub bloom_fp_rate: f64,
    pub backoff: RetryPolicy,
    pub drain_deadline: StdDuration,
    pub numeric_tolerance: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lease_timeout: StdDuration::from_secs(30),
            reclaim_tick: StdDuration::from_secs(5),
            snapshot_interval: StdDuration::from_secs(30),
            feedback_tick: StdDuration::from_secs(30),
            heartbeat_timeout: chrono::Duration::seconds(30),
            default_rate_per_sec: 5.0,
            default_capacity: 10.0,
            proxy_ban_duration: StdDuration::from_secs(300),
            bloom_expected_items: 100_000,
            bloom_fp_rate: 0.01,
            backoff: RetryPolicy::default(),
            drain_deadline: StdDuration::from_secs(60),
            numeric_tolerance: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatusCounters {
    pub job_id: String,
    pub pending: usize,
    pub leased: usize,
    pub dead: usize,
    pub completed: usize,
    pub live_workers: usize,
    pub dead_workers: usize,
    pub job_status: JobStatus,
}

/// Owns every other component for one job and the cooperative background
/// loops that keep them converging: reclamation, periodic checkpoint
/// snapshotting, and feedback-driven rate tuning.
pub struct Coordinator {
    job_id: String,
    config: CoordinatorConfig,
    fingerprints: Arc<FingerprintRegistry>,
    queue: Arc<dyn QueueStore>,
    proxy_pool: Arc<ProxyPool>,
    rate_gate: Arc<RateGate>,
    registry: Arc<WorkerRegistry>,
    dispatcher: Arc<Dispatcher>,
    checkpoint: Arc<dyn CheckpointStore>,
    feedback: Arc<FeedbackController>,
    accepting: Arc<AtomicBool>,
    cancel: CancellationToken,
    background: AsyncMutex<Vec<JoinHandle<()>>>,
    schema: std::sync::RwLock<Option<Schema>>,
}

impl Coordinator {
    pub fn new(
        job_id: impl Into<String>,
        config: CoordinatorConfig,
        queue: Arc<dyn QueueStore>,
        checkpoint: Arc<dyn CheckpointStore>,
        sink: Arc<dyn Sink>,
    ) -> Arc<Self> {
        let job_id = job_id.into();
        let fingerprints = Arc::new(FingerprintRegistry::new(
            config.bloom_expected_items,
            config.bloom_fp_rate,
        ));
        let proxy_pool = Arc::new(ProxyPool::new(config.proxy_ban_duration));
        let rate_gate = Arc::new(RateGate::new(
            config.default_rate_per_sec,
            config.default_capacity,
            config.default_capacity as usize,
        ));
        let registry = Arc::new(WorkerRegistry::new(config.heartbeat_timeout));
        let feedback = Arc::new(FeedbackController::new(
            Thresholds::default(),
            config.default_rate_per_sec,
            config.default_capacity as usize,
            StdDuration::from_secs(60),
        ));
        let validator = Arc::new(Validator::new(config.numeric_tolerance));

        let dispatcher = Arc::new(Dispatcher::new(
            job_id.clone(),
            queue.clone(),
            proxy_pool.clone(),
            checkpoint.clone(),
            feedback.clone(),
            validator,
            sink,
            config.backoff,
        ));

        let coordinator = Arc::new(Self {
            job_id,
            config,
            fingerprints,
            queue,
            proxy_pool,
            rate_gate,
            registry,
            dispatcher,
            checkpoint,
            feedback,
            accepting: Arc::new(AtomicBool::new(true)),
            cancel: CancellationToken::new(),
            background: AsyncMutex::new(Vec::new()),
            schema: std::sync::RwLock::new(None),
        });

        coordinator.clone().spawn_background_loops();
        coordinator
    }

    fn spawn_background_loops(self: Arc<Self>) {
        let reclaim = self.clone();
        let reclaim_handle = tokio::spawn(async move { reclaim.reclamation_loop().await });

        let snapshot = self.clone();
        let snapshot_handle = tokio::spawn(async move { snapshot.snapshot_loop().await });

        let feedback = self.clone();
        let feedback_handle = tokio::spawn(async move { feedback.feedback_loop().await });

        // Locking a freshly-constructed, not-yet-shared mutex never blocks.
        if let Ok(mut guard) = self.background.try_lock() {
            guard.push(reclaim_handle);
            guard.push(snapshot_handle);
            guard.push(feedback_handle);
        }
    }

    async fn reclamation_loop(&self) {
        let mut ticker = interval(self.config.reclaim_tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    if let Err(e) = self.dispatcher.reclaim_expired(now).await {
                        warn!("reclaim_expired failed: {}", e);
                    }
                    for dead in self.registry.list_dead(now) {
                        match self.dispatcher.reclaim_worker(&dead.worker_id).await {
                            Ok(n) if n > 0 => {
                                info!("reclaimed {} lease(s) from dead worker {}", n, dead.worker_id);
                            }
                            Err(e) => warn!("reclaim_worker failed for {}: {}", dead.worker_id, e),
                            _ => {}
                        }
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    async fn snapshot_loop(&self) {
        let mut ticker = interval(self.config.snapshot_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.checkpoint.snapshot(&self.job_id).await {
                        warn!("checkpoint snapshot failed: {}", e);
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    async fn feedback_loop(&self) {
        let mut ticker = interval(self.config.feedback_tick);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    for domain in self.feedback.domains() {
                        if let Some(adjustment) = self.feedback.tick(&domain, now) {
                            self.apply_adjustment(&domain, adjustment);
                        }
                    }
                }
                _ = self.cancel.cancelled() => break,
            }
        }
    }

    fn apply_adjustment(&self, domain: &str, adjustment: Adjustment) {
        match adjustment {
            Adjustment::HalveRateAndDecrementConcurrency {
                new_rate,
                new_concurrency,
            } => {
                self.rate_gate.update(domain, new_rate, self.config.default_capacity);
                self.rate_gate.set_concurrency_limit(domain, new_concurrency);
                info!("feedback: halved rate to {new_rate} and concurrency to {new_concurrency} for {domain}");
            }
            Adjustment::HalveProxyRotateInterval { new_interval } => {
                self.proxy_pool.set_rotate_interval(domain, new_interval);
                info!("feedback: halved proxy rotate interval to {new_interval:?} for {domain}");
            }
            Adjustment::IncreaseRate { new_rate } => {
                self.rate_gate.update(domain, new_rate, self.config.default_capacity);
                info!("feedback: increased rate to {new_rate} for {domain}");
            }
        }
    }

    /// Submit one request: builds it, dedups by fingerprint, enqueues a
    /// task if new. Always returns the assigned id, even for a duplicate.
    pub async fn submit(&self, params: NewRequest) -> Result<Uuid, CoordinatorError> {
        if !self.accepting.load(AtomicOrdering::Relaxed) {
            return Err(CoordinatorError::JobNotAccepting);
        }
        let request = Request::new(params)?;
        let id = request.id;
        self.enqueue_if_new(request, Utc::now()).await?;
        Ok(id)
    }

    /// Submit a batch atomically with respect to deduplication: every
    /// request in the batch is fingerprinted and enqueued before this call
    /// returns, with no other submission interleaved mid-batch able to
    /// observe a partially-deduped state.
    pub async fn submit_batch(
        &self,
        batch: Vec<NewRequest>,
    ) -> Result<Vec<Uuid>, CoordinatorError> {
        if !self.accepting.load(AtomicOrdering::Relaxed) {
            return Err(CoordinatorError::JobNotAccepting);
        }
        let now = Utc::now();
        let mut ids = Vec::with_capacity(batch.len());
        for params in batch {
            let request = Request::new(params)?;
            ids.push(request.id);
            self.enqueue_if_new(request, now).await?;
        }
        Ok(ids)
    }

    async fn enqueue_if_new(
        &self,
        request: Request,
        now: chrono::DateTime<Utc>,
    ) -> Result<(), CoordinatorError> {
        let normalized = fingerprint::normalize_url(&request.url)
            .unwrap_or_else(|_| request.url.clone());
        let fp = fingerprint::compute(request.method, &normalized, request.body.as_deref());

        if let Some(deadline) = request.deadline {
            if deadline <= now {
                self.checkpoint
                    .mark_failed(&self.job_id, request.id, "deadline already past at submit".to_owned())
                    .await
                    .ok();
                return Ok(());
            }
        }

        if self.fingerprints.register(fp) == DedupOutcome::Duplicate {
            return Ok(());
        }

        let task = Task::new(request, now);
        self.queue.enqueue(task).await?;
        Ok(())
    }

    pub async fn register_worker(&self, worker_id: &str, capacity: usize) -> Result<(), CoordinatorError> {
        Ok(self.registry.register(worker_id, capacity, Utc::now())?)
    }

    pub async fn heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        leased_count: usize,
    ) -> Result<(), CoordinatorError> {
        Ok(self.registry.heartbeat(worker_id, status, leased_count, Utc::now())?)
    }

    pub async fn deregister_worker(&self, worker_id: &str) -> Result<(), CoordinatorError> {
        self.registry.deregister(worker_id)?;
        self.dispatcher.reclaim_worker(worker_id).await?;
        Ok(())
    }

    pub async fn claim(&self, worker_id: &str) -> Result<Option<Task>, CoordinatorError> {
        Ok(self
            .dispatcher
            .claim(worker_id, self.config.lease_timeout, Utc::now())
            .await?)
    }

    pub async fn ack(
        &self,
        worker_id: &str,
        task: &Task,
        result: ResultRecord,
    ) -> Result<Disposition, CoordinatorError> {
        let normalized = fingerprint::normalize_url(&task.request.url)
            .unwrap_or_else(|_| task.request.url.clone());
        let fp = fingerprint::compute(
            task.request.method,
            &normalized,
            task.request.body.as_deref(),
        );
        let schema = self.schema.read().expect("schema lock poisoned").clone();
        Ok(self
            .dispatcher
            .ack(worker_id, task, result, schema.as_ref(), fp, Utc::now())
            .await?)
    }

    /// Install the schema success bodies are checked against. `None` (the
    /// default) treats every `Success` result as `Valid`.
    pub fn set_schema(&self, schema: Schema) {
        *self.schema.write().expect("schema lock poisoned") = Some(schema);
    }

    pub fn rate_gate(&self) -> &Arc<RateGate> {
        &self.rate_gate
    }

    pub fn proxy_pool(&self) -> &Arc<ProxyPool> {
        &self.proxy_pool
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn status(&self) -> Result<StatusCounters, CoordinatorError> {
        let now = Utc::now();
        let counts = self.queue.counts().await?;
        let snapshot = self
            .checkpoint
            .load(&self.job_id)
            .await
            .map(|s| (s.completed.len(), s.status))
            .unwrap_or((0, JobStatus::Running));
        Ok(StatusCounters {
            job_id: self.job_id.clone(),
            pending: counts.pending,
            leased: counts.leased,
            dead: counts.dead,
            completed: snapshot.0,
            live_workers: self.registry.list_live(now).len(),
            dead_workers: self.registry.list_dead(now).len(),
            job_status: snapshot.1,
        })
    }

    /// Stop accepting submissions and wait until no task is pending or
    /// leased.
    pub async fn drain(&self) -> Result<(), CoordinatorError> {
        self.accepting.store(false, AtomicOrdering::Relaxed);
        loop {
            let counts = self.queue.counts().await?;
            if counts.pending == 0 && counts.leased == 0 {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(StdDuration::from_millis(100)) => {}
                _ = self.cancel.cancelled() => return Ok(()),
            }
        }
    }

    /// `force = false` drains gracefully up to the configured deadline,
    /// escalating to a forced stop if it is exceeded. `force = true`
    /// cancels in-flight waits immediately, reclaims every live worker's
    /// leases, and flushes a final checkpoint snapshot.
    pub async fn stop(&self, force: bool) -> Result<(), CoordinatorError> {
        self.accepting.store(false, AtomicOrdering::Relaxed);

        if !force {
            if timeout(self.config.drain_deadline, self.drain()).await.is_ok() {
                return self.finish_stop().await;
            }
            warn!("job {}: graceful drain deadline exceeded, escalating to forced stop", self.job_id);
        }

        self.cancel.cancel();
        let now = Utc::now();
        for worker in self.registry.list_live(now) {
            self.dispatcher.reclaim_worker(&worker.worker_id).await.ok();
        }
        self.dispatcher.reclaim_expired(now).await.ok();
        self.finish_stop().await
    }

    async fn finish_stop(&self) -> Result<(), CoordinatorError> {
        self.checkpoint
            .set_status(&self.job_id, JobStatus::Completed)
            .await
            .ok();
        self.checkpoint.snapshot(&self.job_id).await.ok();
        let mut guard = self.background.lock().await;
        for handle in guard.drain(..) {
            handle.abort();
        }
        Ok(())
    }

    /// Reload a job's checkpoint and restore the fingerprint registry so a
    /// restart does not re-dispatch already-completed work.
    pub async fn resume(&self) -> Result<(), CoordinatorError> {
        let snapshot = self
            .checkpoint
            .load(&self.job_id)
            .await
            .map_err(|e| CoordinatorError::CheckpointCorrupt(e.to_string()))?;
        self.fingerprints.restore(snapshot.completed);
        self.checkpoint
            .set_status(&self.job_id, JobStatus::Running)
            .await
            .ok();
        Ok(())
    }
}
