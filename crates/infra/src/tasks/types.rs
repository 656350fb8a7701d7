//! Task model: kinds, payloads, enqueue options and the execution record.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Closed set of task types. Each kind has exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    SendVerificationMail,
    SendResetPasswordMail,
    /// One image per task.
    #[serde(rename = "upload_s3_object")]
    UploadImage,
    /// All images of one record in a single task; a partial failure retries the batch.
    #[serde(rename = "upload_multiple_s3_objects")]
    UploadImageBatch,
    /// A set of keys removed together.
    #[serde(rename = "delete_s3_object")]
    DeleteObjects,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::SendVerificationMail,
        TaskKind::SendResetPasswordMail,
        TaskKind::UploadImage,
        TaskKind::UploadImageBatch,
        TaskKind::DeleteObjects,
    ];

    /// Wire identifier stored with the task.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::SendVerificationMail => "send_verification_mail",
            TaskKind::SendResetPasswordMail => "send_reset_password_mail",
            TaskKind::UploadImage => "upload_s3_object",
            TaskKind::UploadImageBatch => "upload_multiple_s3_objects",
            TaskKind::DeleteObjects => "delete_s3_object",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown task type: {0}")]
pub struct UnknownTaskKind(pub String);

impl FromStr for TaskKind {
    type Err = UnknownTaskKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownTaskKind(s.to_string()))
    }
}

/// Priority class. Critical workers get the larger share of concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    Critical,
    #[default]
    Default,
}

impl QueueClass {
    pub const ALL: [QueueClass; 2] = [QueueClass::Critical, QueueClass::Default];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueClass::Critical => "critical",
            QueueClass::Default => "default",
        }
    }
}

impl std::fmt::Display for QueueClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(QueueClass::Critical),
            "default" => Ok(QueueClass::Default),
            other => Err(format!("unknown queue class: {other}")),
        }
    }
}

/// Producer-side options for a single enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Failed attempts tolerated before the task is archived.
    pub max_retry: u32,
    /// Delay before the task becomes claimable.
    pub process_in: Duration,
    pub queue: QueueClass,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_retry: 3,
            process_in: Duration::ZERO,
            queue: QueueClass::Default,
        }
    }
}

impl EnqueueOptions {
    pub fn max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn process_in(mut self, delay: Duration) -> Self {
        self.process_in = delay;
        self
    }

    pub fn queue(mut self, queue: QueueClass) -> Self {
        self.queue = queue;
        self
    }
}

/// Payload of `upload_s3_object`; also the element of `upload_multiple_s3_objects`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadImage {
    #[serde(with = "base64_bytes")]
    pub image: Vec<u8>,
    #[serde(rename = "objectKey")]
    pub object_key: String,
    pub extension: String,
}

impl From<coffeeshop_products::PreparedImage> for UploadImage {
    fn from(image: coffeeshop_products::PreparedImage) -> Self {
        Self {
            image: image.bytes,
            object_key: image.object_key,
            extension: image.format.extension().to_string(),
        }
    }
}

/// Payload of both mail task kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMail {
    pub email: String,
}

/// Typed view of a payload. Batches and key sets travel as bare JSON arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    SendVerificationMail(SendMail),
    SendResetPasswordMail(SendMail),
    UploadImage(UploadImage),
    UploadImageBatch(Vec<UploadImage>),
    DeleteObjects(Vec<String>),
}

impl TaskPayload {
    pub fn kind(&self) -> TaskKind {
        match self {
            TaskPayload::SendVerificationMail(_) => TaskKind::SendVerificationMail,
            TaskPayload::SendResetPasswordMail(_) => TaskKind::SendResetPasswordMail,
            TaskPayload::UploadImage(_) => TaskKind::UploadImage,
            TaskPayload::UploadImageBatch(_) => TaskKind::UploadImageBatch,
            TaskPayload::DeleteObjects(_) => TaskKind::DeleteObjects,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            TaskPayload::SendVerificationMail(p) | TaskPayload::SendResetPasswordMail(p) => {
                serde_json::to_vec(p)
            }
            TaskPayload::UploadImage(p) => serde_json::to_vec(p),
            TaskPayload::UploadImageBatch(p) => serde_json::to_vec(p),
            TaskPayload::DeleteObjects(p) => serde_json::to_vec(p),
        }
    }

    pub fn decode(kind: TaskKind, bytes: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            TaskKind::SendVerificationMail => {
                TaskPayload::SendVerificationMail(serde_json::from_slice(bytes)?)
            }
            TaskKind::SendResetPasswordMail => {
                TaskPayload::SendResetPasswordMail(serde_json::from_slice(bytes)?)
            }
            TaskKind::UploadImage => TaskPayload::UploadImage(serde_json::from_slice(bytes)?),
            TaskKind::UploadImageBatch => {
                TaskPayload::UploadImageBatch(serde_json::from_slice(bytes)?)
            }
            TaskKind::DeleteObjects => TaskPayload::DeleteObjects(serde_json::from_slice(bytes)?),
        })
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Backoff strategy between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    /// base * 2^(retry-1)
    #[default]
    Exponential,
    /// base * retry
    Linear,
}

/// Delay applied before a failed task becomes claimable again.
///
/// How many retries a task gets is decided by the producer (`max_retry`);
/// this only decides how long to wait between them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    /// Retry without waiting.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(retry.saturating_sub(1).min(31) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * retry as f64).min(max_ms),
        };

        // Deterministic jitter keyed on the retry number.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((retry as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Enqueued, waiting for `not_before`.
    Pending,
    /// Leased by a worker.
    Active,
    /// Failed at least once, waiting for its backoff to elapse.
    Retrying,
    Completed,
    /// Gave up: retries exhausted or a fatal error. Never claimed again.
    Archived,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Retrying => "retrying",
            TaskState::Completed => "completed",
            TaskState::Archived => "archived",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Archived)
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "active" => Ok(TaskState::Active),
            "retrying" => Ok(TaskState::Retrying),
            "completed" => Ok(TaskState::Completed),
            "archived" => Ok(TaskState::Archived),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Exclusive claim held by one worker until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

/// One execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// A task as stored by a queue backend.
///
/// `task_type` is kept as the raw wire string so that tasks written by an
/// unknown producer can still be loaded and archived.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub queue: QueueClass,
    pub max_retry: u32,
    pub state: TaskState,
    /// Failed attempts so far.
    pub retried: u32,
    /// Times the task has been claimed (includes lease recoveries).
    pub attempts: u32,
    pub not_before: DateTime<Utc>,
    pub lease: Option<Lease>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<AttemptRecord>,
}

/// Error recorded when a lease runs out before its worker reports back.
pub const LEASE_EXPIRED: &str = "lease expired";

impl TaskRecord {
    /// Encode a payload into a fresh pending record.
    pub fn new(payload: &TaskPayload, opts: EnqueueOptions) -> Result<Self, serde_json::Error> {
        Ok(Self::from_parts(
            payload.kind().as_str(),
            payload.encode()?,
            opts,
        ))
    }

    /// Build a record from an already-encoded payload.
    pub fn from_parts(task_type: impl Into<String>, payload: Vec<u8>, opts: EnqueueOptions) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            payload,
            queue: opts.queue,
            max_retry: opts.max_retry,
            state: TaskState::Pending,
            retried: 0,
            attempts: 0,
            not_before: now + to_chrono(opts.process_in),
            lease: None,
            last_error: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        }
    }

    pub fn kind(&self) -> Result<TaskKind, UnknownTaskKind> {
        self.task_type.parse()
    }

    pub fn decode(&self, kind: TaskKind) -> Result<TaskPayload, serde_json::Error> {
        TaskPayload::decode(kind, &self.payload)
    }

    /// Whether a worker may claim this task at `now`. An active task whose
    /// lease ran out must go through [`TaskRecord::expire_lease`] first.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            TaskState::Pending | TaskState::Retrying => self.not_before <= now,
            TaskState::Active | TaskState::Completed | TaskState::Archived => false,
        }
    }

    /// Active, but its worker stopped renewing before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Active
            && self.lease.as_ref().is_some_and(|l| l.expires_at <= now)
    }

    pub fn lease_owner(&self) -> Option<&str> {
        self.lease.as_ref().map(|l| l.owner.as_str())
    }

    pub fn mark_active(&mut self, owner: &str, lease_for: Duration, now: DateTime<Utc>) {
        self.state = TaskState::Active;
        self.attempts += 1;
        self.lease = Some(Lease {
            owner: owner.to_string(),
            expires_at: now + to_chrono(lease_for),
        });
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.state = TaskState::Completed;
        self.lease = None;
        self.updated_at = now;
        self.record_attempt(started_at, now, None);
    }

    /// Count a failed attempt. Returns `true` if the task was archived.
    pub fn mark_failed(
        &mut self,
        error: String,
        backoff: &BackoffPolicy,
        started_at: DateTime<Utc>,
    ) -> bool {
        let now = Utc::now();
        self.retried += 1;
        self.lease = None;
        self.updated_at = now;
        self.record_attempt(started_at, now, Some(error.clone()));
        self.last_error = Some(error);

        if self.retried < self.max_retry {
            self.state = TaskState::Retrying;
            self.not_before = now + to_chrono(backoff.delay_for_retry(self.retried));
            false
        } else {
            self.state = TaskState::Archived;
            true
        }
    }

    /// Count an attempt whose worker vanished before reporting back. The task
    /// becomes claimable again right away, or is archived once retries run
    /// out. Returns `true` if the task was archived.
    pub fn expire_lease(&mut self, now: DateTime<Utc>) -> bool {
        let started_at = self.updated_at;
        self.retried += 1;
        self.lease = None;
        self.updated_at = now;
        self.record_attempt(started_at, now, Some(LEASE_EXPIRED.to_string()));
        self.last_error = Some(LEASE_EXPIRED.to_string());

        if self.retried < self.max_retry {
            self.state = TaskState::Retrying;
            self.not_before = now;
            false
        } else {
            self.state = TaskState::Archived;
            true
        }
    }

    /// Archive without consuming retries.
    pub fn mark_archived(&mut self, error: String, started_at: DateTime<Utc>) {
        let now = Utc::now();
        self.state = TaskState::Archived;
        self.lease = None;
        self.updated_at = now;
        self.record_attempt(started_at, now, Some(error.clone()));
        self.last_error = Some(error);
    }

    /// Reset an archived task so it runs again from scratch.
    pub fn requeue(&mut self) {
        let now = Utc::now();
        self.state = TaskState::Pending;
        self.retried = 0;
        self.lease = None;
        self.not_before = now;
        self.updated_at = now;
        self.last_error = None;
    }

    fn record_attempt(&mut self, started_at: DateTime<Utc>, finished_at: DateTime<Utc>, error: Option<String>) {
        self.history.push(AttemptRecord {
            attempt: self.attempts,
            started_at,
            finished_at,
            success: error.is_none(),
            error,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
        });
    }
}

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// Worth retrying (network, storage, mail server, deadline).
    #[error("transient failure: {0}")]
    Transient(String),
    /// Retrying cannot help (unknown type, undecodable payload, missing recipient).
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl TaskError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }
}

pub(crate) fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(3650))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload() -> TaskPayload {
        TaskPayload::UploadImage(UploadImage {
            image: vec![0x89, b'P', b'N', b'G'],
            object_key: "images/products/thumbnails/abc.png".to_string(),
            extension: "png".to_string(),
        })
    }

    #[test]
    fn exponential_backoff_calculates_correctly() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_retry(20), Duration::from_secs(10));
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(500));

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Linear,
            jitter: 0.0,
        };

        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(300));
    }

    #[test]
    fn kind_wire_names_round_trip() {
        for kind in TaskKind::ALL {
            assert_eq!(kind.as_str().parse::<TaskKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_string(&kind).unwrap(),
                format!("\"{}\"", kind.as_str())
            );
        }
        assert_eq!(
            "resize_image".parse::<TaskKind>(),
            Err(UnknownTaskKind("resize_image".to_string()))
        );
    }

    #[test]
    fn upload_payload_wire_format() {
        let bytes = upload().encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["objectKey"], "images/products/thumbnails/abc.png");
        assert_eq!(json["extension"], "png");
        assert_eq!(json["image"], "iVBORw==");
    }

    #[test]
    fn batch_and_delete_payloads_are_bare_arrays() {
        let delete = TaskPayload::DeleteObjects(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(delete.encode().unwrap(), br#"["a","b"]"#.to_vec());

        let TaskPayload::UploadImage(one) = upload() else {
            unreachable!()
        };
        let batch = TaskPayload::UploadImageBatch(vec![one.clone(), one]);
        let json: serde_json::Value = serde_json::from_slice(&batch.encode().unwrap()).unwrap();
        assert_eq!(json.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn decode_rejects_mismatched_payload() {
        let bytes = upload().encode().unwrap();
        assert!(TaskPayload::decode(TaskKind::SendVerificationMail, &bytes).is_err());
        assert_eq!(TaskPayload::decode(TaskKind::UploadImage, &bytes).unwrap(), upload());
    }

    #[test]
    fn new_record_honours_options() {
        let opts = EnqueueOptions::default()
            .queue(QueueClass::Critical)
            .max_retry(5)
            .process_in(Duration::from_secs(60));
        let record = TaskRecord::new(&upload(), opts).unwrap();

        assert_eq!(record.task_type, "upload_s3_object");
        assert_eq!(record.queue, QueueClass::Critical);
        assert_eq!(record.max_retry, 5);
        assert_eq!(record.state, TaskState::Pending);
        assert!(!record.is_claimable(Utc::now()));
        assert!(record.is_claimable(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn default_options() {
        let opts = EnqueueOptions::default();
        assert_eq!(opts.max_retry, 3);
        assert_eq!(opts.process_in, Duration::ZERO);
        assert_eq!(opts.queue, QueueClass::Default);
    }

    #[test]
    fn task_lifecycle() {
        let mut record = TaskRecord::new(&upload(), EnqueueOptions::default()).unwrap();
        let now = Utc::now();

        record.mark_active("w1", Duration::from_secs(30), now);
        assert_eq!(record.state, TaskState::Active);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.lease_owner(), Some("w1"));
        assert!(!record.is_claimable(now));

        record.mark_completed(now);
        assert_eq!(record.state, TaskState::Completed);
        assert!(record.lease.is_none());
        assert_eq!(record.history.len(), 1);
        assert!(record.history[0].success);
    }

    #[test]
    fn failures_retry_until_max_then_archive() {
        let mut record =
            TaskRecord::new(&upload(), EnqueueOptions::default().max_retry(2)).unwrap();
        let backoff = BackoffPolicy::fixed(Duration::from_secs(5));

        record.mark_active("w1", Duration::from_secs(30), Utc::now());
        assert!(!record.mark_failed("boom 1".to_string(), &backoff, Utc::now()));
        assert_eq!(record.state, TaskState::Retrying);
        assert_eq!(record.retried, 1);
        assert!(record.not_before > Utc::now());

        record.mark_active("w1", Duration::from_secs(30), Utc::now());
        assert!(record.mark_failed("boom 2".to_string(), &backoff, Utc::now()));
        assert_eq!(record.state, TaskState::Archived);
        assert_eq!(record.last_error.as_deref(), Some("boom 2"));
        assert!(!record.is_claimable(Utc::now() + chrono::Duration::days(1)));
    }

    #[test]
    fn expired_lease_counts_as_failed_attempt() {
        let mut record = TaskRecord::new(&upload(), EnqueueOptions::default()).unwrap();
        let then = Utc::now() - chrono::Duration::minutes(5);
        record.mark_active("crashed", Duration::from_secs(30), then);
        let now = Utc::now();
        assert!(record.lease_expired(now));
        assert!(!record.is_claimable(now));

        assert!(!record.expire_lease(now));
        assert_eq!(record.state, TaskState::Retrying);
        assert_eq!(record.retried, 1);
        assert_eq!(record.last_error.as_deref(), Some(LEASE_EXPIRED));
        assert_eq!(record.lease_owner(), None);
        assert_eq!(record.history.len(), 1);
        assert!(!record.history[0].success);
        assert!(record.is_claimable(now));
    }

    #[test]
    fn expired_lease_archives_when_retries_run_out() {
        let mut record =
            TaskRecord::new(&upload(), EnqueueOptions::default().max_retry(1)).unwrap();
        let now = Utc::now();
        record.mark_active("crashed", Duration::ZERO, now);

        assert!(record.expire_lease(now));
        assert_eq!(record.state, TaskState::Archived);
        assert!(!record.is_claimable(now + chrono::Duration::days(1)));
    }

    #[test]
    fn requeue_resets_counters() {
        let mut record =
            TaskRecord::new(&upload(), EnqueueOptions::default().max_retry(1)).unwrap();
        record.mark_active("w1", Duration::from_secs(30), Utc::now());
        record.mark_failed("boom".to_string(), &BackoffPolicy::immediate(), Utc::now());
        assert_eq!(record.state, TaskState::Archived);

        record.requeue();
        assert_eq!(record.state, TaskState::Pending);
        assert_eq!(record.retried, 0);
        assert!(record.is_claimable(Utc::now()));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Backoff never exceeds the cap (plus jitter) and never shrinks between retries.
            #[test]
            fn exponential_backoff_is_monotonic_and_capped(base_ms in 1u64..1_000, retry in 1u32..40) {
                let policy = BackoffPolicy {
                    base_delay: Duration::from_millis(base_ms),
                    max_delay: Duration::from_secs(60),
                    strategy: BackoffStrategy::Exponential,
                    jitter: 0.0,
                };
                let current = policy.delay_for_retry(retry);
                let next = policy.delay_for_retry(retry + 1);

                prop_assert!(current <= Duration::from_secs(60));
                prop_assert!(next >= current);
            }
        }
    }
}
