//! Component #6: Dispatcher.
//!
//! The top-level control loop serving the worker protocol: lease, ack,
//! nack, and the background reclamation loop. Retry classification is the
//! direct generalization of a webhook-delivery retry switch to this
//! substrate's result-status enum.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use harvest_common::model::{ResultRecord, ResultStatus, Task};
use harvest_common::retry::RetryPolicy;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::feedback::{FeedbackController, SignalKind};
use crate::fingerprint::Fingerprint;
use crate::proxy::ProxyPool;
use crate::queue::{QueueError, QueueStore};
use crate::traits::Sink;
use crate::validator::{CheckResult, Schema, Validator, Verdict};

#[derive(Error, Debug)]
pub enum DispatcherError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("sink rejected record: {0}")]
    SinkRejected(String),
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

/// What happened to a task after `ack`/`nack` was processed.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Completed,
    RequeuedForRetry { next_visible_at: DateTime<Utc> },
    Dead { reason: String },
}

/// Decision produced by classifying a non-success fetch result.
struct RetryDecision {
    retry: bool,
    ban_proxy: bool,
    signal: SignalKind,
    terminal_reason: Option<String>,
}

fn classify(result: &ResultRecord) -> RetryDecision {
    match result.status {
        ResultStatus::Success => unreachable!("classify is only called for non-success results"),
        ResultStatus::Timeout => RetryDecision {
            retry: true,
            ban_proxy: false,
            signal: SignalKind::OtherError,
            terminal_reason: None,
        },
        ResultStatus::NetworkError => RetryDecision {
            retry: true,
            ban_proxy: false,
            signal: SignalKind::OtherError,
            terminal_reason: None,
        },
        ResultStatus::Blocked => {
            let rate_limited = result.http_status == Some(429);
            RetryDecision {
                retry: true,
                ban_proxy: !rate_limited,
                signal: if rate_limited {
                    SignalKind::RateLimitError
                } else {
                    SignalKind::BlockError
                },
                terminal_reason: None,
            }
        }
        ResultStatus::CaptchaRequired => RetryDecision {
            retry: true,
            ban_proxy: true,
            signal: SignalKind::BlockError,
            terminal_reason: None,
        },
        ResultStatus::HttpError => {
            let status = result.http_status.unwrap_or(0);
            let retryable = status == 408 || status == 429 || (500..600).contains(&status);
            let signal = if status == 429 {
                SignalKind::RateLimitError
            } else {
                SignalKind::OtherError
            };
            RetryDecision {
                retry: retryable,
                ban_proxy: false,
                signal,
                terminal_reason: if retryable {
                    None
                } else {
                    Some(format!("non-retryable http status {status}"))
                },
            }
        }
        ResultStatus::ValidationFailed => RetryDecision {
            retry: false,
            ban_proxy: false,
            signal: SignalKind::OtherError,
            terminal_reason: Some("validation_failed".to_owned()),
        },
    }
}

/// Owns the durable queue, proxy health, worker leases, checkpoint and
/// feedback loop for one job, serving the worker protocol's claim/ack/nack.
pub struct Dispatcher {
    job_id: String,
    queue: Arc<dyn QueueStore>,
    proxy_pool: Arc<ProxyPool>,
    checkpoint: Arc<dyn CheckpointStore>,
    feedback: Arc<FeedbackController>,
    validator: Arc<Validator>,
    sink: Arc<dyn Sink>,
    backoff: RetryPolicy,
    consecutive_blocks: Mutex<HashMap<Uuid, u32>>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job_id: String,
        queue: Arc<dyn QueueStore>,
        proxy_pool: Arc<ProxyPool>,
        checkpoint: Arc<dyn CheckpointStore>,
        feedback: Arc<FeedbackController>,
        validator: Arc<Validator>,
        sink: Arc<dyn Sink>,
        backoff: RetryPolicy,
    ) -> Self {
        Self {
            job_id,
            queue,
            proxy_pool,
            checkpoint,
            feedback,
            validator,
            sink,
            backoff,
            consecutive_blocks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn claim(
        &self,
        worker_id: &str,
        timeout: StdDuration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, DispatcherError> {
        Ok(self.queue.lease(worker_id, timeout, now).await?)
    }

    /// Process a completed fetch. A `Success` result is schema-checked; a
    /// `Valid`/`Suspicious` verdict is written to the Sink and the
    /// fingerprint is marked complete. Any other outcome (including an
    /// `Invalid` verdict) is routed through the retry/terminal policy.
    pub async fn ack(
        &self,
        worker_id: &str,
        task: &Task,
        mut result: ResultRecord,
        schema: Option<&Schema>,
        fingerprint: Fingerprint,
        now: DateTime<Utc>,
    ) -> Result<Disposition, DispatcherError> {
        self.reset_block_counter(task.id);

        if result.status != ResultStatus::Success {
            return self.handle_failure(worker_id, task, result, now).await;
        }

        let verdict = self.validate_body(schema, &result);
        match verdict.verdict {
            Verdict::Valid | Verdict::Suspicious => {
                result.suspicious = verdict.verdict == Verdict::Suspicious;
                self.sink
                    .write(&self.job_id, &result)
                    .await
                    .map_err(|e| DispatcherError::SinkRejected(e.to_string()))?;
                self.checkpoint
                    .mark_complete(&self.job_id, fingerprint)
                    .await
                    .map_err(|e| DispatcherError::Checkpoint(e.to_string()))?;
                self.queue.ack(task.id, worker_id).await?;
                self.feedback
                    .observe(&task.request.domain, SignalKind::Success, now);
                info!("task {} completed with verdict {:?}", task.id, verdict.verdict);
                Ok(Disposition::Completed)
            }
            Verdict::Invalid => {
                warn!("task {} failed validation ({:?}), terminating", task.id, verdict.reasons);
                self.terminate_dead(worker_id, task, format!("validation_failed: {:?}", verdict.reasons))
                    .await
            }
        }
    }

    async fn handle_failure(
        &self,
        worker_id: &str,
        task: &Task,
        result: ResultRecord,
        now: DateTime<Utc>,
    ) -> Result<Disposition, DispatcherError> {
        let decision = classify(&result);
        self.feedback
            .observe(&task.request.domain, decision.signal, now);

        if decision.ban_proxy {
            if let Some(proxy) = &result.proxy_used {
                self.proxy_pool.ban(&task.request.domain, proxy, now);
            }
            if self.bump_block_counter(task.id) == 3 {
                warn!("block storm detected for task {} on domain {}", task.id, task.request.domain);
                self.feedback
                    .observe(&task.request.domain, SignalKind::BlockStorm, now);
            }
        } else {
            self.reset_block_counter(task.id);
        }

        if !decision.retry {
            let reason = decision
                .terminal_reason
                .unwrap_or_else(|| format!("{:?}", result.status));
            return self.terminate_dead(worker_id, task, reason).await;
        }

        let delay = self.backoff.time_until_next_retry(task.attempt);
        match self.queue.nack(task.id, worker_id, delay, now).await? {
            Some(requeued) => Ok(Disposition::RequeuedForRetry {
                next_visible_at: requeued.next_visible_at,
            }),
            None => {
                let reason = result
                    .error_message
                    .unwrap_or_else(|| format!("{:?}", result.status));
                self.checkpoint
                    .mark_failed(&self.job_id, task.request.id, reason.clone())
                    .await
                    .map_err(|e| DispatcherError::Checkpoint(e.to_string()))?;
                Ok(Disposition::Dead { reason })
            }
        }
    }

    async fn terminate_dead(
        &self,
        worker_id: &str,
        task: &Task,
        reason: String,
    ) -> Result<Disposition, DispatcherError> {
        // Force termination regardless of remaining retry budget: both
        // validation failures and non-retryable http errors are terminal
        // even when attempt < max_retries.
        self.queue.force_dead(task.id, worker_id).await?;
        self.checkpoint
            .mark_failed(&self.job_id, task.request.id, reason.clone())
            .await
            .map_err(|e| DispatcherError::Checkpoint(e.to_string()))?;
        Ok(Disposition::Dead { reason })
    }

    fn validate_body(&self, schema: Option<&Schema>, result: &ResultRecord) -> CheckResult {
        let Some(schema) = schema else {
            return CheckResult {
                verdict: Verdict::Valid,
                reasons: Vec::new(),
            };
        };
        match serde_json::from_slice::<serde_json::Value>(&result.body) {
            Ok(value) => self.validator.check(schema, &value),
            Err(e) => CheckResult {
                verdict: Verdict::Invalid,
                reasons: vec![format!("body is not valid json: {e}")],
            },
        }
    }

    fn bump_block_counter(&self, task_id: Uuid) -> u32 {
        let mut guard = self
            .consecutive_blocks
            .lock()
            .expect("dispatcher block counters poisoned");
        let entry = guard.entry(task_id).or_insert(0);
        *entry += 1;
        *entry
    }

    fn reset_block_counter(&self, task_id: Uuid) {
        self.consecutive_blocks
            .lock()
            .expect("dispatcher block counters poisoned")
            .remove(&task_id);
    }

    /// Background reclamation: expired leases and dead workers' leases are
    /// both returned to PENDING without incrementing `attempt`.
    pub async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<usize, DispatcherError> {
        Ok(self.queue.reclaim_expired(now).await?.len())
    }

    pub async fn reclaim_worker(&self, worker_id: &str) -> Result<usize, DispatcherError> {
        Ok(self.queue.reclaim_worker(worker_id).await?.len())
    }

    pub fn feedback(&self) -> &Arc<FeedbackController> {
        &self.feedback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::queue::InMemoryQueueStore;
    use crate::traits::SinkError;
    use harvest_common::model::{HttpMethod, NewRequest, Request};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        writes: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Sink for CountingSink {
        async fn write(&self, _job_id: &str, _record: &ResultRecord) -> Result<(), SinkError> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_dispatcher() -> (Dispatcher, Arc<CountingSink>, Arc<InMemoryQueueStore>) {
        let queue = Arc::new(InMemoryQueueStore::new());
        let sink = Arc::new(CountingSink {
            writes: AtomicUsize::new(0),
        });
        let dispatcher = Dispatcher::new(
            "job1".to_owned(),
            queue.clone(),
            Arc::new(ProxyPool::new(StdDuration::from_secs(60))),
            Arc::new(InMemoryCheckpointStore::new()),
            Arc::new(FeedbackController::new(
                Default::default(),
                10.0,
                8,
                StdDuration::from_secs(30),
            )),
            Arc::new(Validator::default()),
            sink.clone(),
            RetryPolicy::default(),
        );
        (dispatcher, sink, queue)
    }

    fn make_task(max_retries: u32, now: DateTime<Utc>) -> Task {
        let request = Request::new(NewRequest {
            url: "https://example.com/x".to_owned(),
            method: HttpMethod::GET,
            max_retries,
            ..Default::default()
        })
        .unwrap();
        Task::new(request, now)
    }

    fn success_result(request_id: Uuid) -> ResultRecord {
        ResultRecord {
            request_id,
            attempt: 0,
            status: ResultStatus::Success,
            http_status: Some(200),
            body: b"{}".to_vec(),
            elapsed_ms: 10,
            proxy_used: None,
            error_message: None,
            suspicious: false,
        }
    }

    #[tokio::test]
    async fn success_writes_to_sink_and_acks() {
        let (dispatcher, sink, queue) = make_dispatcher();
        let now = Utc::now();
        let task = make_task(3, now);
        queue.enqueue(task.clone()).await.unwrap();
        let leased = queue.lease("w1", StdDuration::from_secs(30), now).await.unwrap().unwrap();

        let fp = crate::fingerprint::compute(HttpMethod::GET, &task.request.url, None);
        let disposition = dispatcher
            .ack("w1", &leased, success_result(task.request.id), None, fp, now)
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Completed);
        assert_eq!(sink.writes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_retries_with_backoff() {
        let (dispatcher, _sink, queue) = make_dispatcher();
        let now = Utc::now();
        let task = make_task(3, now);
        queue.enqueue(task.clone()).await.unwrap();
        let leased = queue.lease("w1", StdDuration::from_secs(30), now).await.unwrap().unwrap();

        let result = ResultRecord {
            request_id: task.request.id,
            attempt: 0,
            status: ResultStatus::Timeout,
            http_status: None,
            body: vec![],
            elapsed_ms: 10,
            proxy_used: None,
            error_message: Some("timed out".to_owned()),
            suspicious: false,
        };
        let fp = crate::fingerprint::compute(HttpMethod::GET, &task.request.url, None);
        let disposition = dispatcher.ack("w1", &leased, result, None, fp, now).await.unwrap();
        assert!(matches!(disposition, Disposition::RequeuedForRetry { .. }));
    }

    #[tokio::test]
    async fn client_error_4xx_is_terminal() {
        let (dispatcher, _sink, queue) = make_dispatcher();
        let now = Utc::now();
        let task = make_task(3, now);
        queue.enqueue(task.clone()).await.unwrap();
        let leased = queue.lease("w1", StdDuration::from_secs(30), now).await.unwrap().unwrap();

        let result = ResultRecord {
            request_id: task.request.id,
            attempt: 0,
            status: ResultStatus::HttpError,
            http_status: Some(404),
            body: vec![],
            elapsed_ms: 10,
            proxy_used: None,
            error_message: None,
            suspicious: false,
        };
        let fp = crate::fingerprint::compute(HttpMethod::GET, &task.request.url, None);
        let disposition = dispatcher.ack("w1", &leased, result, None, fp, now).await.unwrap();
        assert!(matches!(disposition, Disposition::Dead { .. }));
    }

    #[tokio::test]
    async fn validation_failed_is_terminal_even_with_retry_budget_left() {
        let (dispatcher, sink, queue) = make_dispatcher();
        let now = Utc::now();
        let task = make_task(5, now);
        queue.enqueue(task.clone()).await.unwrap();
        let leased = queue.lease("w1", StdDuration::from_secs(30), now).await.unwrap().unwrap();

        let schema = Schema {
            fields: vec![crate::validator::FieldSpec::new(
                "title",
                crate::validator::FieldType::String,
            )
            .required()],
            strict: false,
        };
        let mut result = success_result(task.request.id);
        result.body = b"{}".to_vec();
        let fp = crate::fingerprint::compute(HttpMethod::GET, &task.request.url, None);
        let disposition = dispatcher
            .ack("w1", &leased, result, Some(&schema), fp, now)
            .await
            .unwrap();
        assert!(matches!(disposition, Disposition::Dead { .. }));
        assert_eq!(sink.writes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rate_limited_block_is_classified_as_rate_limit_error_not_ban() {
        let mut result = success_result(Uuid::now_v7());
        result.status = ResultStatus::Blocked;
        result.http_status = Some(429);
        let decision = classify(&result);
        assert_eq!(decision.signal, SignalKind::RateLimitError);
        assert!(!decision.ban_proxy);
    }

    #[test]
    fn non_rate_limited_block_is_classified_as_block_error_and_banned() {
        let mut result = success_result(Uuid::now_v7());
        result.status = ResultStatus::Blocked;
        result.http_status = Some(403);
        let decision = classify(&result);
        assert_eq!(decision.signal, SignalKind::BlockError);
        assert!(decision.ban_proxy);
    }

    #[tokio::test]
    async fn block_storm_fires_exactly_once_per_streak() {
        let (dispatcher, _sink, queue) = make_dispatcher();
        let mut now = Utc::now();
        let task = make_task(10, now);
        queue.enqueue(task.clone()).await.unwrap();

        for _ in 0..5 {
            let leased = queue
                .lease("w1", StdDuration::from_secs(30), now)
                .await
                .unwrap()
                .unwrap();
            let mut result = success_result(task.request.id);
            result.status = ResultStatus::Blocked;
            result.http_status = Some(403);
            result.proxy_used = Some("proxy1".to_owned());
            let fp = crate::fingerprint::compute(HttpMethod::GET, &task.request.url, None);
            dispatcher
                .ack("w1", &leased, result, None, fp, now)
                .await
                .unwrap();
            now += chrono::Duration::minutes(10);
        }

        assert_eq!(
            dispatcher
                .feedback()
                .signal_count(&task.request.domain, SignalKind::BlockStorm),
            1
        );
    }
}
