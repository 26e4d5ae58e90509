//! Component #2: PriorityQueue.
//!
//! An ordered, multi-producer / multi-consumer queue of pending tasks keyed
//! by `(priority desc, next_visible_at, enqueued_at)`. The `QueueStore`
//! trait is the seam a real deployment would use to swap in a durable
//! backend (a Postgres-backed queue is one such backend) without this
//! substrate mandating one - storage backend layout is an explicit
//! Non-goal.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use harvest_common::model::{Lease, Task, TaskState};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue store is full or unavailable")]
    FullOrUnavailable,
    #[error("task {0} is not currently leased")]
    NotLeased(Uuid),
    #[error("task {0} is leased to a different worker")]
    WrongWorker(Uuid),
    #[error("task {0} not found")]
    NotFound(Uuid),
}

/// Durable-store contract for the priority queue. All task state
/// transitions go through an implementation of this trait.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Return the highest-priority visible task for `worker_id`, leased
    /// until `now + timeout`. Never fails; returns `Ok(None)` when no
    /// visible task exists.
    async fn lease(
        &self,
        worker_id: &str,
        timeout: StdDuration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, QueueError>;

    async fn ack(&self, task_id: Uuid, worker_id: &str) -> Result<Task, QueueError>;

    /// Nack a leased task. If `attempt < max_retries` it is re-enqueued
    /// with `next_visible_at = now + backoff` and returned; otherwise it
    /// terminates as DEAD (moved to the dead-letter list) and `None` is
    /// returned.
    async fn nack(
        &self,
        task_id: Uuid,
        worker_id: &str,
        backoff: StdDuration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, QueueError>;

    /// Force a leased task directly to DEAD, bypassing the retry budget.
    /// Used for terminal outcomes (a non-retryable http status, a failed
    /// validation) where the fetch itself concluded but no further
    /// attempt should be made regardless of `attempt < max_retries`.
    async fn force_dead(&self, task_id: Uuid, worker_id: &str) -> Result<Task, QueueError>;

    /// Move any task whose lease has expired back to PENDING without
    /// incrementing `attempt`.
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Task>, QueueError>;

    /// Move every task leased to `worker_id` back to PENDING without
    /// incrementing `attempt` (a dead worker's leases).
    async fn reclaim_worker(&self, worker_id: &str) -> Result<Vec<Task>, QueueError>;

    async fn dead_letters(&self) -> Result<Vec<Task>, QueueError>;

    async fn counts(&self) -> Result<QueueCounts, QueueError>;
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub leased: usize,
    pub dead: usize,
}

/// Ordering key: lower is dispatched first. Priority is negated so a
/// `BinaryHeap` (a max-heap) pops the highest-priority, earliest-visible,
/// earliest-enqueued task first.
#[derive(Debug, Clone, Eq, PartialEq)]
struct PendingEntry {
    neg_priority: i64,
    next_visible_at: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
    task_id: Uuid,
}

impl Ord for PendingEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the "smallest" key (highest
        // priority, soonest visible, earliest enqueued) compares greatest.
        other
            .neg_priority
            .cmp(&self.neg_priority)
            .then_with(|| other.next_visible_at.cmp(&self.next_visible_at))
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
    }
}

impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct State {
    heap: BinaryHeap<PendingEntry>,
    tasks: HashMap<Uuid, Task>,
    dead: Vec<Task>,
}

/// Default in-memory `QueueStore` implementation.
pub struct InMemoryQueueStore {
    state: Mutex<State>,
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                heap: BinaryHeap::new(),
                tasks: HashMap::new(),
                dead: Vec::new(),
            }),
        }
    }

    fn push_pending(state: &mut State, task: Task) {
        let entry = PendingEntry {
            neg_priority: -(task.request.priority as i64),
            next_visible_at: task.next_visible_at,
            enqueued_at: task.enqueued_at,
            task_id: task.id,
        };
        state.tasks.insert(task.id, task);
        state.heap.push(entry);
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, mut task: Task) -> Result<(), QueueError> {
        task.state = TaskState::Pending;
        task.lease = None;
        let mut state = self.state.lock().expect("queue store poisoned");
        Self::push_pending(&mut state, task);
        Ok(())
    }

    async fn lease(
        &self,
        worker_id: &str,
        timeout: StdDuration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, QueueError> {
        let mut state = self.state.lock().expect("queue store poisoned");

        // Pop entries until we find one that is still visible and pending;
        // stale entries (superseded by a later re-enqueue or already
        // leased/acked) are discarded without being re-pushed.
        let mut deferred: Vec<PendingEntry> = Vec::new();
        let found = loop {
            let Some(entry) = state.heap.pop() else {
                break None;
            };
            let Some(task) = state.tasks.get(&entry.task_id) else {
                continue;
            };
            if task.state != TaskState::Pending {
                continue;
            }
            if task.next_visible_at != entry.next_visible_at {
                // Superseded by a newer enqueue of the same task.
                continue;
            }
            if !task.is_visible(now) {
                deferred.push(entry);
                continue;
            }
            break Some(entry.task_id);
        };

        for entry in deferred {
            state.heap.push(entry);
        }

        let Some(task_id) = found else {
            return Ok(None);
        };

        let lease_expires_at = now + chrono::Duration::from_std(timeout).unwrap_or_default();
        let task = state.tasks.get_mut(&task_id).expect("task just found");
        task.state = TaskState::Leased;
        task.lease = Some(Lease {
            worker_id: worker_id.to_owned(),
            lease_expires_at,
        });
        Ok(Some(task.clone()))
    }

    async fn ack(&self, task_id: Uuid, worker_id: &str) -> Result<Task, QueueError> {
        let mut state = self.state.lock().expect("queue store poisoned");
        let task = state
            .tasks
            .get_mut(&task_id)
            .ok_or(QueueError::NotFound(task_id))?;
        match &task.lease {
            Some(lease) if lease.worker_id == worker_id => {}
            Some(_) => return Err(QueueError::WrongWorker(task_id)),
            None => return Err(QueueError::NotLeased(task_id)),
        }
        task.state = TaskState::Acked;
        task.lease = None;
        let done = task.clone();
        state.tasks.remove(&task_id);
        Ok(done)
    }

    async fn nack(
        &self,
        task_id: Uuid,
        worker_id: &str,
        backoff: StdDuration,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>, QueueError> {
        let mut state = self.state.lock().expect("queue store poisoned");
        {
            let task = state
                .tasks
                .get(&task_id)
                .ok_or(QueueError::NotFound(task_id))?;
            match &task.lease {
                Some(lease) if lease.worker_id == worker_id => {}
                Some(_) => return Err(QueueError::WrongWorker(task_id)),
                None => return Err(QueueError::NotLeased(task_id)),
            }
        }

        let mut task = state.tasks.remove(&task_id).expect("checked above");
        task.attempt += 1;
        task.lease = None;

        if task.attempt >= task.request.max_retries {
            task.state = TaskState::Dead;
            state.dead.push(task.clone());
            return Ok(None);
        }

        task.state = TaskState::Pending;
        task.next_visible_at = now + chrono::Duration::from_std(backoff).unwrap_or_default();
        Self::push_pending(&mut state, task.clone());
        Ok(Some(task))
    }

    async fn force_dead(&self, task_id: Uuid, worker_id: &str) -> Result<Task, QueueError> {
        let mut state = self.state.lock().expect("queue store poisoned");
        {
            let task = state
                .tasks
                .get(&task_id)
                .ok_or(QueueError::NotFound(task_id))?;
            match &task.lease {
                Some(lease) if lease.worker_id == worker_id => {}
                Some(_) => return Err(QueueError::WrongWorker(task_id)),
                None => return Err(QueueError::NotLeased(task_id)),
            }
        }
        let mut task = state.tasks.remove(&task_id).expect("checked above");
        task.lease = None;
        task.state = TaskState::Dead;
        state.dead.push(task.clone());
        Ok(task)
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<Task>, QueueError> {
        let mut state = self.state.lock().expect("queue store poisoned");
        let expired_ids: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Leased
                    && t.lease
                        .as_ref()
                        .map(|l| l.lease_expires_at < now)
                        .unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();

        let mut reclaimed = Vec::new();
        for id in expired_ids {
            let mut task = state.tasks.remove(&id).expect("id from tasks map");
            task.lease = None;
            task.state = TaskState::Pending;
            // Reclamation is not attributable to the request: attempt is unchanged.
            Self::push_pending(&mut state, task.clone());
            reclaimed.push(task);
        }
        Ok(reclaimed)
    }

    async fn reclaim_worker(&self, worker_id: &str) -> Result<Vec<Task>, QueueError> {
        let mut state = self.state.lock().expect("queue store poisoned");
        let ids: Vec<Uuid> = state
            .tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Leased
                    && t.lease.as_ref().map(|l| l.worker_id == worker_id).unwrap_or(false)
            })
            .map(|t| t.id)
            .collect();

        let mut reclaimed = Vec::new();
        for id in ids {
            let mut task = state.tasks.remove(&id).expect("id from tasks map");
            task.lease = None;
            task.state = TaskState::Pending;
            Self::push_pending(&mut state, task.clone());
            reclaimed.push(task);
        }
        Ok(reclaimed)
    }

    async fn dead_letters(&self) -> Result<Vec<Task>, QueueError> {
        Ok(self.state.lock().expect("queue store poisoned").dead.clone())
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let state = self.state.lock().expect("queue store poisoned");
        let leased = state
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Leased)
            .count();
        let pending = state.tasks.len() - leased;
        Ok(QueueCounts {
            pending,
            leased,
            dead: state.dead.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_common::model::{HttpMethod, NewRequest, Request};

    fn make_task(priority: i32, max_retries: u32, now: DateTime<Utc>) -> Task {
        let request = Request::new(NewRequest {
            url: "https://example.com/x".to_owned(),
            method: HttpMethod::GET,
            priority,
            max_retries,
            ..Default::default()
        })
        .unwrap();
        Task::new(request, now)
    }

    #[tokio::test]
    async fn lease_returns_none_on_empty_queue() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        assert!(store
            .lease("w1", StdDuration::from_secs(30), now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn priority_ordering_within_and_across_bands() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();

        let a = make_task(1, 3, now);
        let b = make_task(5, 3, now + chrono::Duration::milliseconds(1));
        let c = make_task(5, 3, now + chrono::Duration::milliseconds(2));
        let d = make_task(10, 3, now + chrono::Duration::milliseconds(3));

        for t in [a, b.clone(), c.clone(), d.clone()] {
            store.enqueue(t).await.unwrap();
        }

        let order: Vec<Uuid> = {
            let mut order = Vec::new();
            loop {
                let leased = store
                    .lease("w1", StdDuration::from_secs(30), now)
                    .await
                    .unwrap();
                match leased {
                    Some(task) => {
                        order.push(task.id);
                        store.ack(task.id, "w1").await.unwrap();
                    }
                    None => break,
                }
            }
            order
        };

        assert_eq!(order, vec![d.id, b.id, c.id, a.id]);
    }

    #[tokio::test]
    async fn lease_excludes_leased_task_until_ack_or_expiry() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let task = make_task(1, 3, now);
        let id = task.id;
        store.enqueue(task).await.unwrap();

        let leased = store
            .lease("w1", StdDuration::from_secs(30), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.id, id);

        assert!(store
            .lease("w2", StdDuration::from_secs(30), now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn nack_requeues_with_backoff_until_max_retries() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let task = make_task(1, 2, now);
        let id = task.id;
        store.enqueue(task).await.unwrap();

        let leased = store
            .lease("w1", StdDuration::from_secs(30), now)
            .await
            .unwrap()
            .unwrap();
        let requeued = store
            .nack(leased.id, "w1", StdDuration::from_secs(1), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(requeued.attempt, 1);
        assert!(requeued.next_visible_at > now);

        // Not visible yet, so lease should return none.
        assert!(store
            .lease("w1", StdDuration::from_secs(30), now)
            .await
            .unwrap()
            .is_none());

        let later = now + chrono::Duration::seconds(2);
        let leased_again = store
            .lease("w1", StdDuration::from_secs(30), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased_again.id, id);

        // Second nack hits max_retries == 2, so the task terminates as DEAD.
        let result = store
            .nack(leased_again.id, "w1", StdDuration::from_secs(1), later)
            .await
            .unwrap();
        assert!(result.is_none());

        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
    }

    #[tokio::test]
    async fn expired_leases_are_reclaimed_without_incrementing_attempt() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let task = make_task(1, 3, now);
        store.enqueue(task).await.unwrap();

        let leased = store
            .lease("w1", StdDuration::from_secs(5), now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased.attempt, 0);

        let later = now + chrono::Duration::seconds(10);
        let reclaimed = store.reclaim_expired(later).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempt, 0);

        let leased_again = store
            .lease("w2", StdDuration::from_secs(5), later)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(leased_again.id, leased.id);
        assert_eq!(leased_again.attempt, 0);
    }

    #[tokio::test]
    async fn reclaim_worker_moves_its_leases_back_to_pending() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        store.enqueue(make_task(1, 3, now)).await.unwrap();
        store.enqueue(make_task(2, 3, now)).await.unwrap();

        let _ = store
            .lease("dead-worker", StdDuration::from_secs(30), now)
            .await
            .unwrap();
        let _ = store
            .lease("dead-worker", StdDuration::from_secs(30), now)
            .await
            .unwrap();

        let reclaimed = store.reclaim_worker("dead-worker").await.unwrap();
        assert_eq!(reclaimed.len(), 2);

        let counts = store.counts().await.unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.leased, 0);
    }

    #[tokio::test]
    async fn max_retries_zero_terminates_on_first_failure() {
        let store = InMemoryQueueStore::new();
        let now = Utc::now();
        let task = make_task(1, 0, now);
        let id = task.id;
        store.enqueue(task).await.unwrap();

        let leased = store
            .lease("w1", StdDuration::from_secs(30), now)
            .await
            .unwrap()
            .unwrap();
        let result = store
            .nack(leased.id, "w1", StdDuration::from_secs(1), now)
            .await
            .unwrap();
        assert!(result.is_none());
        let dead = store.dead_letters().await.unwrap();
        assert_eq!(dead[0].id, id);
    }
}
