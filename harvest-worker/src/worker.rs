//! `WorkerLoop`: an in-process worker speaking the claim/fetch/ack protocol
//! against a `Coordinator`, generalized from `hook-worker::worker`'s
//! semaphore-bounded poll-and-spawn loop to this substrate's
//! claim/fetch/ack-or-nack cycle.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use harvest_common::model::{Task, WorkerStatus};
use harvest_core::coordinator::Coordinator;
use harvest_core::dispatcher::Disposition;
use harvest_core::proxy::ProxyOutcome;
use harvest_core::rate::AcquireOutcome;
use harvest_core::traits::{Fetcher, SignatureProvider};
use tokio::sync::Semaphore;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Tunables for one `WorkerLoop`, analogous to `hook-worker::config::Config`'s
/// poll/concurrency/timeout fields.
#[derive(Debug, Clone, Copy)]
pub struct WorkerLoopConfig {
    pub capacity: usize,
    pub poll_interval: StdDuration,
    pub heartbeat_interval: StdDuration,
    pub rate_acquire_timeout: StdDuration,
}

impl Default for WorkerLoopConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            poll_interval: StdDuration::from_millis(200),
            heartbeat_interval: StdDuration::from_secs(10),
            rate_acquire_timeout: StdDuration::from_secs(30),
        }
    }
}

/// Polls a `Coordinator` for tasks and drives each through fetch/ack, up to
/// `capacity` concurrently, reporting heartbeats on a separate cadence.
pub struct WorkerLoop {
    worker_id: String,
    coordinator: Arc<Coordinator>,
    fetcher: Arc<dyn Fetcher>,
    signer: Arc<dyn SignatureProvider>,
    config: WorkerLoopConfig,
    leased_count: Arc<AtomicUsize>,
}

impl WorkerLoop {
    pub fn new(
        worker_id: impl Into<String>,
        coordinator: Arc<Coordinator>,
        fetcher: Arc<dyn Fetcher>,
        signer: Arc<dyn SignatureProvider>,
        config: WorkerLoopConfig,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            coordinator,
            fetcher,
            signer,
            config,
            leased_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register with the coordinator and run until its cancellation token
    /// fires, then deregister. Never returns early on transient claim
    /// failures; only the initial registration can fail.
    pub async fn run(self: Arc<Self>) -> Result<(), crate::error::WorkerError> {
        self.coordinator
            .register_worker(&self.worker_id, self.config.capacity)
            .await?;
        info!("worker {} registered with capacity {}", self.worker_id, self.config.capacity);

        let heartbeat = self.clone();
        let cancel = self.coordinator.cancellation_token();
        let heartbeat_cancel = cancel.clone();
        let heartbeat_handle = tokio::spawn(async move {
            heartbeat.heartbeat_loop(heartbeat_cancel).await;
        });

        let semaphore = Arc::new(Semaphore::new(self.config.capacity));
        let mut ticker = interval(self.config.poll_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let saturation = 1.0
                        - semaphore.available_permits() as f64 / self.config.capacity as f64;
                    metrics::gauge!("crawl_worker_saturation_percent").set(saturation);

                    let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                        continue;
                    };
                    match self.coordinator.claim(&self.worker_id).await {
                        Ok(Some(task)) => {
                            self.leased_count.fetch_add(1, Ordering::SeqCst);
                            let this = self.clone();
                            tokio::spawn(async move {
                                this.process_task(task).await;
                                this.leased_count.fetch_sub(1, Ordering::SeqCst);
                                drop(permit);
                            });
                        }
                        Ok(None) => drop(permit),
                        Err(e) => {
                            warn!("claim failed for worker {}: {}", self.worker_id, e);
                            drop(permit);
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }

        heartbeat_handle.abort();
        self.coordinator.deregister_worker(&self.worker_id).await?;
        info!("worker {} deregistered", self.worker_id);
        Ok(())
    }

    async fn heartbeat_loop(&self, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let leased = self.leased_count.load(Ordering::SeqCst);
                    let status = if leased == 0 { WorkerStatus::Idle } else { WorkerStatus::Busy };
                    if let Err(e) = self.coordinator.heartbeat(&self.worker_id, status, leased).await {
                        warn!("heartbeat failed for worker {}: {}", self.worker_id, e);
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    async fn process_task(&self, task: Task) {
        let domain = task.request.domain.clone();
        let cancel = self.coordinator.cancellation_token();

        let outcome = self
            .coordinator
            .rate_gate()
            .acquire(&domain, self.config.rate_acquire_timeout, &cancel)
            .await;
        if outcome != AcquireOutcome::Ok {
            // The lease is left outstanding; it will be reclaimed once it
            // expires and retried without having consumed an attempt.
            return;
        }

        // Held for the rest of this function; released on drop once the
        // fetch/ack completes, the way `permit` in `run` bounds the worker's
        // own concurrency. This one bounds per-domain concurrency, which a
        // fixed-size `Semaphore` can't be resized to express at runtime.
        let _concurrency_permit = match self
            .coordinator
            .rate_gate()
            .acquire_concurrency(&domain, self.config.rate_acquire_timeout, &cancel)
            .await
        {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let selection = self.coordinator.proxy_pool().select(&domain, Utc::now()).ok();
        let proxy = selection.as_ref().map(|s| s.proxy.as_str());

        let request = self.signer.stamp(task.request.clone());
        let started = std::time::Instant::now();
        let result = self.fetcher.fetch(&request, proxy).await;
        let rtt = started.elapsed();

        if let Some(proxy) = proxy {
            let outcome = if result.status == harvest_common::model::ResultStatus::Success {
                ProxyOutcome::Success
            } else {
                ProxyOutcome::Failure
            };
            self.coordinator
                .proxy_pool()
                .record(&domain, proxy, outcome, rtt, Utc::now());
        }

        match self.coordinator.ack(&self.worker_id, &task, result).await {
            Ok(Disposition::Completed) => {
                metrics::counter!("crawl_tasks_completed_total").increment(1);
            }
            Ok(Disposition::RequeuedForRetry { .. }) => {
                metrics::counter!("crawl_tasks_retried_total").increment(1);
            }
            Ok(Disposition::Dead { .. }) => {
                metrics::counter!("crawl_tasks_dead_total").increment(1);
            }
            Err(e) => {
                error!("failed to ack task {}: {}", task.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harvest_common::model::{HttpMethod, NewRequest, Request, ResultRecord, ResultStatus};
    use harvest_core::checkpoint::InMemoryCheckpointStore;
    use harvest_core::coordinator::CoordinatorConfig;
    use harvest_core::queue::InMemoryQueueStore;
    use harvest_core::traits::{IdentitySignatureProvider, Sink, SinkError};
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    struct EchoFetcher;

    #[async_trait]
    impl Fetcher for EchoFetcher {
        async fn fetch(&self, request: &Request, _proxy: Option<&str>) -> ResultRecord {
            ResultRecord {
                request_id: request.id,
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
    }

    struct CountingSink {
        writes: StdAtomicUsize,
    }

    #[async_trait]
    impl Sink for CountingSink {
        async fn write(&self, _job_id: &str, _record: &ResultRecord) -> Result<(), SinkError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_loop_claims_fetches_and_acks_a_submitted_task() {
        let queue = Arc::new(InMemoryQueueStore::new());
        let checkpoint = Arc::new(InMemoryCheckpointStore::new());
        let sink = Arc::new(CountingSink {
            writes: StdAtomicUsize::new(0),
        });
        let coordinator = Coordinator::new(
            "job-1",
            CoordinatorConfig::default(),
            queue,
            checkpoint,
            sink.clone(),
        );

        coordinator
            .submit(NewRequest {
                url: "https://example.com/page".to_owned(),
                method: HttpMethod::GET,
                ..Default::default()
            })
            .await
            .unwrap();

        let worker = Arc::new(WorkerLoop::new(
            "w1",
            coordinator.clone(),
            Arc::new(EchoFetcher),
            Arc::new(IdentitySignatureProvider),
            WorkerLoopConfig {
                poll_interval: StdDuration::from_millis(10),
                heartbeat_interval: StdDuration::from_millis(50),
                ..Default::default()
            },
        ));

        let cancel = coordinator.cancellation_token();
        let run_handle = tokio::spawn(worker.run());

        let deadline = std::time::Instant::now() + StdDuration::from_secs(2);
        while sink.writes.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        assert_eq!(sink.writes.load(Ordering::SeqCst), 1);

        cancel.cancel();
        run_handle.await.unwrap().unwrap();
    }
}
