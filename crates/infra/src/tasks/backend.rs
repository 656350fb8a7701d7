//! Queue backend abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use super::types::{QueueClass, TaskId, TaskRecord, TaskState};

/// Durable store of tasks with lease-based claiming.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Store a new task.
    async fn enqueue(&self, task: TaskRecord) -> Result<TaskId, QueueError>;

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueError>;

    /// Lease the oldest claimable task of `queue` to `worker`.
    ///
    /// Pending and retrying tasks are claimable once `not_before` has passed.
    /// Active tasks of `queue` whose lease has run out are first charged a
    /// failed attempt (see [`TaskRecord::expire_lease`]), which either makes
    /// them claimable again or archives them.
    async fn claim(
        &self,
        queue: QueueClass,
        worker: &str,
        lease_for: Duration,
    ) -> Result<Option<TaskRecord>, QueueError>;

    /// Persist the outcome of an attempt.
    ///
    /// Fails with [`QueueError::LeaseLost`] if `worker` no longer holds the lease.
    async fn finish(&self, task: &TaskRecord, worker: &str) -> Result<(), QueueError>;

    async fn list_by_state(
        &self,
        state: TaskState,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, QueueError>;

    /// Put an archived task back in the queue with fresh retry counters.
    async fn requeue_archived(&self, id: TaskId) -> Result<TaskRecord, QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task already exists: {0}")]
    AlreadyExists(TaskId),
    #[error("lease on task {0} is no longer held by this worker")]
    LeaseLost(TaskId),
    #[error("task {0} is not archived")]
    NotArchived(TaskId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Task counts per state.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub active: usize,
    pub retrying: usize,
    pub completed: usize,
    pub archived: usize,
}

impl QueueStats {
    pub(crate) fn add(&mut self, state: TaskState, n: usize) {
        match state {
            TaskState::Pending => self.pending += n,
            TaskState::Active => self.active += n,
            TaskState::Retrying => self.retrying += n,
            TaskState::Completed => self.completed += n,
            TaskState::Archived => self.archived += n,
        }
    }
}

/// In-memory backend for tests and local development.
#[derive(Debug, Default)]
pub struct InMemoryQueueBackend {
    tasks: RwLock<HashMap<TaskId, TaskRecord>>,
    failing_enqueues: AtomicUsize,
}

impl InMemoryQueueBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Make the next `n` enqueues fail with a storage error.
    pub fn fail_next_enqueues(&self, n: usize) {
        self.failing_enqueues.store(n, Ordering::SeqCst);
    }

    /// Every stored task, oldest first.
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        let Ok(tasks) = self.tasks.read() else {
            return Vec::new();
        };
        let mut all: Vec<_> = tasks.values().cloned().collect();
        all.sort_by_key(|t| (t.created_at, t.id));
        all
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_enqueues
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn poisoned<T>(_: T) -> QueueError {
    QueueError::Storage("task map lock poisoned".to_string())
}

#[async_trait]
impl QueueBackend for InMemoryQueueBackend {
    async fn enqueue(&self, task: TaskRecord) -> Result<TaskId, QueueError> {
        if self.take_injected_failure() {
            return Err(QueueError::Storage("injected enqueue failure".to_string()));
        }
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        if tasks.contains_key(&task.id) {
            return Err(QueueError::AlreadyExists(task.id));
        }
        let id = task.id;
        tasks.insert(id, task);
        Ok(id)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        Ok(tasks.get(&id).cloned())
    }

    async fn claim(
        &self,
        queue: QueueClass,
        worker: &str,
        lease_for: Duration,
    ) -> Result<Option<TaskRecord>, QueueError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let now = Utc::now();

        for task in tasks
            .values_mut()
            .filter(|t| t.queue == queue && t.lease_expired(now))
        {
            let owner = task.lease_owner().unwrap_or_default().to_string();
            let archived = task.expire_lease(now);
            warn!(task_id = %task.id, owner = %owner, retried = task.retried, archived, "lease expired");
        }

        let next = tasks
            .values()
            .filter(|t| t.queue == queue && t.is_claimable(now))
            .min_by_key(|t| (t.not_before, t.created_at, t.id))
            .map(|t| t.id);

        Ok(next.and_then(|id| {
            let task = tasks.get_mut(&id)?;
            task.mark_active(worker, lease_for, now);
            Some(task.clone())
        }))
    }

    async fn finish(&self, task: &TaskRecord, worker: &str) -> Result<(), QueueError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let stored = tasks.get_mut(&task.id).ok_or(QueueError::NotFound(task.id))?;
        if stored.state != TaskState::Active || stored.lease_owner() != Some(worker) {
            return Err(QueueError::LeaseLost(task.id));
        }
        *stored = task.clone();
        Ok(())
    }

    async fn list_by_state(
        &self,
        state: TaskState,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        let mut result: Vec<_> = tasks.values().filter(|t| t.state == state).cloned().collect();
        result.sort_by_key(|t| (t.updated_at, t.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn requeue_archived(&self, id: TaskId) -> Result<TaskRecord, QueueError> {
        let mut tasks = self.tasks.write().map_err(poisoned)?;
        let task = tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if task.state != TaskState::Archived {
            return Err(QueueError::NotArchived(id));
        }
        task.requeue();
        Ok(task.clone())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let tasks = self.tasks.read().map_err(poisoned)?;
        let mut stats = QueueStats::default();
        for task in tasks.values() {
            stats.add(task.state, 1);
        }
        Ok(stats)
    }
}

#[async_trait]
impl<B: QueueBackend + ?Sized> QueueBackend for Arc<B> {
    async fn enqueue(&self, task: TaskRecord) -> Result<TaskId, QueueError> {
        (**self).enqueue(task).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueError> {
        (**self).get(id).await
    }

    async fn claim(
        &self,
        queue: QueueClass,
        worker: &str,
        lease_for: Duration,
    ) -> Result<Option<TaskRecord>, QueueError> {
        (**self).claim(queue, worker, lease_for).await
    }

    async fn finish(&self, task: &TaskRecord, worker: &str) -> Result<(), QueueError> {
        (**self).finish(task, worker).await
    }

    async fn list_by_state(
        &self,
        state: TaskState,
        limit: usize,
    ) -> Result<Vec<TaskRecord>, QueueError> {
        (**self).list_by_state(state, limit).await
    }

    async fn requeue_archived(&self, id: TaskId) -> Result<TaskRecord, QueueError> {
        (**self).requeue_archived(id).await
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        (**self).stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::types::{BackoffPolicy, EnqueueOptions, LEASE_EXPIRED, TaskPayload};

    const LEASE: Duration = Duration::from_secs(30);

    fn delete_task(opts: EnqueueOptions) -> TaskRecord {
        TaskRecord::new(&TaskPayload::DeleteObjects(vec!["k".to_string()]), opts).unwrap()
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let backend = InMemoryQueueBackend::new();
        let id = backend.enqueue(delete_task(EnqueueOptions::default())).await.unwrap();

        let claimed = backend.claim(QueueClass::Default, "w1", LEASE).await.unwrap().unwrap();
        assert_eq!(claimed.id, id);
        assert_eq!(claimed.state, TaskState::Active);
        assert_eq!(claimed.attempts, 1);

        assert!(backend.claim(QueueClass::Default, "w2", LEASE).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_respects_queue_class() {
        let backend = InMemoryQueueBackend::new();
        backend
            .enqueue(delete_task(EnqueueOptions::default().queue(QueueClass::Critical)))
            .await
            .unwrap();

        assert!(backend.claim(QueueClass::Default, "w1", LEASE).await.unwrap().is_none());
        assert!(backend.claim(QueueClass::Critical, "w1", LEASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delayed_task_is_not_claimable_early() {
        let backend = InMemoryQueueBackend::new();
        backend
            .enqueue(delete_task(
                EnqueueOptions::default().process_in(Duration::from_secs(3600)),
            ))
            .await
            .unwrap();

        assert!(backend.claim(QueueClass::Default, "w1", LEASE).await.unwrap().is_none());
        assert_eq!(backend.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn claims_oldest_ready_first() {
        let backend = InMemoryQueueBackend::new();
        let first = backend.enqueue(delete_task(EnqueueOptions::default())).await.unwrap();
        let second = backend.enqueue(delete_task(EnqueueOptions::default())).await.unwrap();

        let a = backend.claim(QueueClass::Default, "w1", LEASE).await.unwrap().unwrap();
        let b = backend.claim(QueueClass::Default, "w1", LEASE).await.unwrap().unwrap();
        assert_eq!((a.id, b.id), (first, second));
    }

    #[tokio::test]
    async fn finish_requires_lease() {
        let backend = InMemoryQueueBackend::new();
        backend.enqueue(delete_task(EnqueueOptions::default())).await.unwrap();
        let mut claimed = backend.claim(QueueClass::Default, "w1", LEASE).await.unwrap().unwrap();
        claimed.mark_completed(Utc::now());

        assert_eq!(
            backend.finish(&claimed, "w2").await,
            Err(QueueError::LeaseLost(claimed.id))
        );
        backend.finish(&claimed, "w1").await.unwrap();
        assert_eq!(backend.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed() {
        let backend = InMemoryQueueBackend::new();
        let id = backend.enqueue(delete_task(EnqueueOptions::default())).await.unwrap();

        backend.claim(QueueClass::Default, "crashed", Duration::ZERO).await.unwrap().unwrap();
        let reclaimed = backend.claim(QueueClass::Default, "w2", LEASE).await.unwrap().unwrap();

        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.attempts, 2);
        assert_eq!(reclaimed.retried, 1);
        assert_eq!(reclaimed.last_error.as_deref(), Some(LEASE_EXPIRED));
        assert_eq!(reclaimed.lease_owner(), Some("w2"));
    }

    #[tokio::test]
    async fn crashing_task_is_archived_after_max_retry() {
        let backend = InMemoryQueueBackend::new();
        let id = backend
            .enqueue(delete_task(EnqueueOptions::default().max_retry(2)))
            .await
            .unwrap();

        let mut claims = 0;
        for _ in 0..10 {
            match backend.claim(QueueClass::Default, "crashed", Duration::ZERO).await.unwrap() {
                Some(_) => claims += 1,
                None => break,
            }
        }

        let task = backend.get(id).await.unwrap().unwrap();
        assert_eq!(claims, 2);
        assert_eq!(task.state, TaskState::Archived);
        assert_eq!(task.attempts, 2);
        assert_eq!(task.retried, 2);
        assert_eq!(task.last_error.as_deref(), Some(LEASE_EXPIRED));
        assert_eq!(backend.list_by_state(TaskState::Archived, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn live_lease_is_not_charged() {
        let backend = InMemoryQueueBackend::new();
        let id = backend
            .enqueue(delete_task(EnqueueOptions::default().max_retry(1)))
            .await
            .unwrap();

        backend.claim(QueueClass::Default, "w1", LEASE).await.unwrap().unwrap();
        assert!(backend.claim(QueueClass::Default, "w2", LEASE).await.unwrap().is_none());

        let task = backend.get(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Active);
        assert_eq!(task.retried, 0);
    }

    #[tokio::test]
    async fn archive_and_requeue() {
        let backend = InMemoryQueueBackend::new();
        let id = backend
            .enqueue(delete_task(EnqueueOptions::default().max_retry(1)))
            .await
            .unwrap();

        let mut claimed = backend.claim(QueueClass::Default, "w1", LEASE).await.unwrap().unwrap();
        assert!(claimed.mark_failed("boom".to_string(), &BackoffPolicy::immediate(), Utc::now()));
        backend.finish(&claimed, "w1").await.unwrap();

        let archived = backend.list_by_state(TaskState::Archived, 10).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert!(backend.claim(QueueClass::Default, "w1", LEASE).await.unwrap().is_none());

        let requeued = backend.requeue_archived(id).await.unwrap();
        assert_eq!(requeued.state, TaskState::Pending);
        assert!(backend.claim(QueueClass::Default, "w1", LEASE).await.unwrap().is_some());
        assert!(matches!(
            backend.requeue_archived(id).await,
            Err(QueueError::NotArchived(got)) if got == id
        ));
    }

    #[tokio::test]
    async fn injected_enqueue_failures() {
        let backend = InMemoryQueueBackend::new();
        backend.fail_next_enqueues(1);

        assert!(matches!(
            backend.enqueue(delete_task(EnqueueOptions::default())).await,
            Err(QueueError::Storage(_))
        ));
        assert!(backend.enqueue(delete_task(EnqueueOptions::default())).await.is_ok());
    }
}
