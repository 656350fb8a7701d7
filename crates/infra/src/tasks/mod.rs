//! Asynchronous task queue: distribution, processing and handlers.
//!
//! ## Components
//!
//! - `TaskDistributor`: serializes payloads and stores them in a backend
//! - `QueueBackend`: lease-based task storage (in-memory or Postgres)
//! - `TaskProcessor`: weighted worker pools that run handlers with retry and backoff
//! - `handlers`: object-store and mail side effects
//!
//! Delivery is at-least-once. A task whose lease expires while its worker is
//! still running may execute twice.

pub mod backend;
pub mod distributor;
pub mod handlers;
pub mod postgres;
pub mod processor;
pub mod types;

pub use backend::{InMemoryQueueBackend, QueueBackend, QueueError, QueueStats};
pub use distributor::{DistributeError, TaskDistributor};
pub use handlers::{MailLinks, standard_registry};
pub use postgres::PgQueueBackend;
pub use processor::{
    HandlerRegistry, ProcessOutcome, ProcessorConfig, ProcessorError, ProcessorHandle,
    ProcessorStats, TaskHandler, TaskProcessor, handler_fn,
};
pub use types::{
    BackoffPolicy, BackoffStrategy, EnqueueOptions, QueueClass, SendMail, TaskError, TaskId,
    TaskKind, TaskPayload, TaskRecord, TaskState, UploadImage,
};
