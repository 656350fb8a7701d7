//! Consumer side of the queue: leases tasks, dispatches them to handlers and
//! records the outcome.
//!
//! ## Execution model
//!
//! - One pool of tokio workers per queue class; the critical pool gets the
//!   larger share (`critical_weight : default_weight`, 2:1 by default).
//! - A worker holds at most one lease at a time.
//! - Every handler call runs under `handler_timeout`. Hitting it drops the
//!   handler future and counts as a transient failure.
//! - Transient failures are retried with backoff until `max_retry` failures
//!   have accumulated, then the task is archived. Fatal failures archive
//!   immediately.
//! - The dispatch table must cover every [`TaskKind`]; construction fails
//!   otherwise.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{QueueBackend, QueueError};
use super::types::{BackoffPolicy, QueueClass, TaskError, TaskId, TaskKind, TaskRecord};

/// Executes one kind of task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskRecord) -> Result<(), TaskError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), TaskError>> + Send,
{
    async fn handle(&self, task: &TaskRecord) -> Result<(), TaskError> {
        (self.0)(task.clone()).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TaskError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Dispatch table from task kind to handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `kind`.
    pub fn register(mut self, kind: TaskKind, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn get(&self, kind: TaskKind) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&kind).cloned()
    }

    /// Kinds without a handler.
    pub fn missing(&self) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|k| !self.handlers.contains_key(k))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Name prefix for worker ids and logs.
    pub name: String,
    /// Total workers across both queue classes.
    pub concurrency: usize,
    pub critical_weight: usize,
    pub default_weight: usize,
    /// Idle wait between empty claims.
    pub poll_interval: Duration,
    /// Deadline for a single handler call.
    pub handler_timeout: Duration,
    /// Lease length; must exceed `handler_timeout`.
    pub lease_duration: Duration,
    /// How long shutdown waits for in-flight handlers.
    pub shutdown_grace: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "task-processor".to_string(),
            concurrency: 10,
            critical_weight: 2,
            default_weight: 1,
            poll_interval: Duration::from_millis(200),
            handler_timeout: Duration::from_secs(30),
            lease_duration: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(10),
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Worker count for a queue class. Each class gets at least one worker.
    pub fn workers_for(&self, queue: QueueClass) -> usize {
        let total = self.concurrency.max(2);
        let weights = self.critical_weight + self.default_weight;
        let critical = ((total * self.critical_weight + weights / 2) / weights.max(1))
            .clamp(1, total - 1);
        match queue {
            QueueClass::Critical => critical,
            QueueClass::Default => total - critical,
        }
    }

    fn validate(&self) -> Result<(), ProcessorError> {
        if self.critical_weight == 0 || self.default_weight == 0 {
            return Err(ProcessorError::InvalidConfig(
                "queue weights must be positive".to_string(),
            ));
        }
        if self.lease_duration <= self.handler_timeout {
            return Err(ProcessorError::InvalidConfig(
                "lease_duration must exceed handler_timeout".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("no handler registered for task types {0:?}")]
    MissingHandlers(Vec<TaskKind>),
    #[error("invalid processor configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// What happened to a claimed task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed(TaskId),
    Retrying { id: TaskId, retried: u32, error: String },
    Archived { id: TaskId, error: String },
    /// The lease expired mid-run and another worker owns the task now; the
    /// result of this attempt was discarded.
    LeaseLost(TaskId),
}

/// Counters since the processor was built.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ProcessorStats {
    pub processed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub archived: u64,
    pub in_flight: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    archived: AtomicU64,
    in_flight: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ProcessorStats {
        ProcessorStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            archived: self.archived.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &ProcessOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            ProcessOutcome::Completed(_) => &self.succeeded,
            ProcessOutcome::Retrying { .. } => &self.retried,
            ProcessOutcome::Archived { .. } => &self.archived,
            ProcessOutcome::LeaseLost(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Holds one slot of the `in_flight` gauge. Released on drop, which also
/// covers a worker aborted mid-handler during shutdown.
struct InFlight<'a>(&'a AtomicU64);

impl<'a> InFlight<'a> {
    fn enter(gauge: &'a AtomicU64) -> Self {
        gauge.fetch_add(1, Ordering::Relaxed);
        Self(gauge)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

struct Inner<B> {
    backend: B,
    registry: HandlerRegistry,
    config: ProcessorConfig,
    counters: Arc<Counters>,
}

/// Task processor. Cheap to clone; clones share handlers and counters.
pub struct TaskProcessor<B> {
    inner: Arc<Inner<B>>,
}

impl<B> Clone for TaskProcessor<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: QueueBackend + 'static> TaskProcessor<B> {
    /// Build a processor. Fails if any task kind lacks a handler.
    pub fn new(
        backend: B,
        registry: HandlerRegistry,
        config: ProcessorConfig,
    ) -> Result<Self, ProcessorError> {
        let missing = registry.missing();
        if !missing.is_empty() {
            return Err(ProcessorError::MissingHandlers(missing));
        }
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                backend,
                registry,
                config,
                counters: Arc::new(Counters::default()),
            }),
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> ProcessorStats {
        self.inner.counters.snapshot()
    }

    /// Claim and run at most one task from `queue`.
    pub async fn process_next(
        &self,
        queue: QueueClass,
        worker: &str,
    ) -> Result<Option<ProcessOutcome>, ProcessorError> {
        let inner = &self.inner;
        let Some(task) = inner
            .backend
            .claim(queue, worker, inner.config.lease_duration)
            .await?
        else {
            return Ok(None);
        };

        debug!(
            worker = %worker,
            task_id = %task.id,
            task_type = %task.task_type,
            attempt = task.attempts,
            "claimed task"
        );

        let result = {
            let _in_flight = InFlight::enter(&inner.counters.in_flight);
            self.execute(task, worker).await
        };

        let outcome = result?;
        inner.counters.record(&outcome);
        Ok(Some(outcome))
    }

    async fn execute(
        &self,
        mut task: TaskRecord,
        worker: &str,
    ) -> Result<ProcessOutcome, ProcessorError> {
        let started = Utc::now();

        let outcome = match self.run_handler(&task).await {
            Ok(()) => {
                task.mark_completed(started);
                debug!(task_id = %task.id, task_type = %task.task_type, "task completed");
                ProcessOutcome::Completed(task.id)
            }
            Err(TaskError::Transient(err)) => {
                if task.mark_failed(err.clone(), &self.inner.config.backoff, started) {
                    error!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        retried = task.retried,
                        error = %err,
                        "task archived after exhausting retries"
                    );
                    ProcessOutcome::Archived {
                        id: task.id,
                        error: err,
                    }
                } else {
                    warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        retried = task.retried,
                        retry_at = %task.not_before,
                        error = %err,
                        "task failed, will retry"
                    );
                    ProcessOutcome::Retrying {
                        id: task.id,
                        retried: task.retried,
                        error: err,
                    }
                }
            }
            Err(TaskError::Fatal(err)) => {
                task.mark_archived(err.clone(), started);
                error!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    error = %err,
                    "task archived on fatal error"
                );
                ProcessOutcome::Archived {
                    id: task.id,
                    error: err,
                }
            }
        };

        match self.inner.backend.finish(&task, worker).await {
            Ok(()) => Ok(outcome),
            Err(QueueError::LeaseLost(id)) => {
                warn!(task_id = %id, worker = %worker, "lease lost before result was recorded");
                Ok(ProcessOutcome::LeaseLost(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn run_handler(&self, task: &TaskRecord) -> Result<(), TaskError> {
        let kind = task.kind().map_err(|e| TaskError::fatal(e.to_string()))?;
        let handler = self
            .inner
            .registry
            .get(kind)
            .ok_or_else(|| TaskError::fatal(format!("no handler registered for {kind}")))?;

        let deadline = self.inner.config.handler_timeout;
        match tokio::time::timeout(deadline, handler.handle(task)).await {
            Ok(result) => result,
            Err(_) => Err(TaskError::transient(format!(
                "handler exceeded deadline of {}ms",
                deadline.as_millis()
            ))),
        }
    }

    /// Start the worker pools on the current tokio runtime.
    pub fn spawn(self) -> ProcessorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();

        for queue in QueueClass::ALL {
            for n in 0..self.inner.config.workers_for(queue) {
                let worker_id = format!("{}-{}-{}", self.inner.config.name, queue, n);
                let processor = self.clone();
                let shutdown = shutdown_rx.clone();
                workers.push(tokio::spawn(async move {
                    worker_loop(processor, queue, worker_id, shutdown).await;
                }));
            }
        }

        info!(
            processor = %self.inner.config.name,
            critical_workers = self.inner.config.workers_for(QueueClass::Critical),
            default_workers = self.inner.config.workers_for(QueueClass::Default),
            "task processor started"
        );

        ProcessorHandle {
            name: self.inner.config.name.clone(),
            shutdown: shutdown_tx,
            workers,
            grace: self.inner.config.shutdown_grace,
            counters: self.inner.counters.clone(),
        }
    }
}

async fn worker_loop<B: QueueBackend + 'static>(
    processor: TaskProcessor<B>,
    queue: QueueClass,
    worker_id: String,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = %worker_id, queue = %queue, "task worker started");
    let poll_interval = processor.inner.config.poll_interval;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match processor.process_next(queue, &worker_id).await {
            Ok(Some(_)) => continue,
            Ok(None) => {}
            Err(e) => error!(worker = %worker_id, error = %e, "failed to process task"),
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }

    debug!(worker = %worker_id, "task worker stopped");
}

/// Handle to a running processor.
pub struct ProcessorHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    grace: Duration,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("name", &self.name)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl ProcessorHandle {
    pub fn stats(&self) -> ProcessorStats {
        self.counters.snapshot()
    }

    /// Stop claiming, wait up to the grace period for in-flight handlers,
    /// then abort whatever is left. Aborted tasks are redelivered once their
    /// lease expires.
    pub async fn shutdown(self) -> ProcessorStats {
        let _ = self.shutdown.send(true);
        let deadline = tokio::time::Instant::now() + self.grace;
        let mut aborted = 0usize;

        for mut worker in self.workers {
            if tokio::time::timeout_at(deadline, &mut worker).await.is_err() {
                worker.abort();
                // Wait for the cancelled future to be dropped.
                let _ = worker.await;
                aborted += 1;
            }
        }

        let stats = self.counters.snapshot();
        info!(
            processor = %self.name,
            aborted_workers = aborted,
            processed = stats.processed,
            "task processor stopped"
        );
        stats
    }
}
