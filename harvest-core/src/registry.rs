//! Component #5: WorkerRegistry.
//!
//! Tracks which workers are registered, their last heartbeat and their
//! current lease load. A worker missing its heartbeat deadline is
//! considered dead; the Dispatcher uses `list_dead` to decide whose
//! leases to reclaim.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use harvest_common::model::{WorkerInfo, WorkerStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("worker {0} is not registered")]
    NotRegistered(String),
}

pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, WorkerInfo>>,
    heartbeat_deadline: chrono::Duration,
}

impl WorkerRegistry {
    pub fn new(heartbeat_deadline: chrono::Duration) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            heartbeat_deadline,
        }
    }

    /// Idempotent on `worker_id`: a re-registration resets counters (lease
    /// count, status, current task) and refreshes the heartbeat, but
    /// preserves the worker's original `started_at`.
    pub fn register(
        &self,
        worker_id: &str,
        capacity: usize,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut workers = self.workers.write().expect("worker registry poisoned");
        if let Some(existing) = workers.get_mut(worker_id) {
            existing.capacity = capacity;
            existing.status = WorkerStatus::Idle;
            existing.current_task_id = None;
            existing.leased_count = 0;
            existing.last_heartbeat_at = now;
            return Ok(());
        }
        workers.insert(
            worker_id.to_owned(),
            WorkerInfo {
                worker_id: worker_id.to_owned(),
                started_at: now,
                last_heartbeat_at: now,
                status: WorkerStatus::Idle,
                current_task_id: None,
                capacity,
                leased_count: 0,
            },
        );
        Ok(())
    }

    pub fn heartbeat(
        &self,
        worker_id: &str,
        status: WorkerStatus,
        leased_count: usize,
        now: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut workers = self.workers.write().expect("worker registry poisoned");
        let info = workers
            .get_mut(worker_id)
            .ok_or_else(|| RegistryError::NotRegistered(worker_id.to_owned()))?;
        info.last_heartbeat_at = now;
        info.status = status;
        info.leased_count = leased_count;
        Ok(())
    }

    pub fn deregister(&self, worker_id: &str) -> Result<WorkerInfo, RegistryError> {
        self.workers
            .write()
            .expect("worker registry poisoned")
            .remove(worker_id)
            .ok_or_else(|| RegistryError::NotRegistered(worker_id.to_owned()))
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerInfo> {
        self.workers
            .read()
            .expect("worker registry poisoned")
            .get(worker_id)
            .cloned()
    }

    /// Workers whose heartbeat deadline has not elapsed as of `now`.
    pub fn list_live(&self, now: DateTime<Utc>) -> Vec<WorkerInfo> {
        self.workers
            .read()
            .expect("worker registry poisoned")
            .values()
            .filter(|w| now - w.last_heartbeat_at <= self.heartbeat_deadline)
            .cloned()
            .collect()
    }

    /// Workers whose heartbeat deadline has elapsed as of `now`. These are
    /// candidates for `QueueStore::reclaim_worker` and removal.
    pub fn list_dead(&self, now: DateTime<Utc>) -> Vec<WorkerInfo> {
        self.workers
            .read()
            .expect("worker registry poisoned")
            .values()
            .filter(|w| now - w.last_heartbeat_at > self.heartbeat_deadline)
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.workers.read().expect("worker registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_heartbeat_updates_status() {
        let registry = WorkerRegistry::new(chrono::Duration::seconds(30));
        let now = Utc::now();
        registry.register("w1", 4, now).unwrap();

        let later = now + chrono::Duration::seconds(5);
        registry
            .heartbeat("w1", WorkerStatus::Busy, 2, later)
            .unwrap();

        let info = registry.get("w1").unwrap();
        assert_eq!(info.status, WorkerStatus::Busy);
        assert_eq!(info.leased_count, 2);
        assert_eq!(info.last_heartbeat_at, later);
    }

    #[test]
    fn re_register_resets_counters_but_preserves_identity() {
        let registry = WorkerRegistry::new(chrono::Duration::seconds(30));
        let now = Utc::now();
        registry.register("w1", 4, now).unwrap();

        let busy_at = now + chrono::Duration::seconds(5);
        registry
            .heartbeat("w1", WorkerStatus::Busy, 3, busy_at)
            .unwrap();

        let restart_at = now + chrono::Duration::seconds(10);
        registry.register("w1", 8, restart_at).unwrap();

        let info = registry.get("w1").unwrap();
        assert_eq!(info.started_at, now, "identity (started_at) is preserved");
        assert_eq!(info.capacity, 8);
        assert_eq!(info.status, WorkerStatus::Idle);
        assert_eq!(info.leased_count, 0);
        assert_eq!(info.current_task_id, None);
        assert_eq!(info.last_heartbeat_at, restart_at);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn heartbeat_on_unknown_worker_errors() {
        let registry = WorkerRegistry::new(chrono::Duration::seconds(30));
        let err = registry
            .heartbeat("ghost", WorkerStatus::Idle, 0, Utc::now())
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered(_)));
    }

    #[test]
    fn stale_worker_is_listed_dead_not_live() {
        let registry = WorkerRegistry::new(chrono::Duration::seconds(30));
        let now = Utc::now();
        registry.register("w1", 4, now).unwrap();

        let fresh_check = now + chrono::Duration::seconds(10);
        assert_eq!(registry.list_live(fresh_check).len(), 1);
        assert_eq!(registry.list_dead(fresh_check).len(), 0);

        let stale_check = now + chrono::Duration::seconds(60);
        assert_eq!(registry.list_live(stale_check).len(), 0);
        assert_eq!(registry.list_dead(stale_check).len(), 1);
    }

    #[test]
    fn deregister_removes_worker() {
        let registry = WorkerRegistry::new(chrono::Duration::seconds(30));
        let now = Utc::now();
        registry.register("w1", 4, now).unwrap();
        let removed = registry.deregister("w1").unwrap();
        assert_eq!(removed.worker_id, "w1");
        assert_eq!(registry.count(), 0);
        assert!(registry.deregister("w1").is_err());
    }
}
