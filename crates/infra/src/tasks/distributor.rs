//! Producer side of the queue.

use tracing::debug;

use super::backend::{QueueBackend, QueueError};
use super::types::{EnqueueOptions, SendMail, TaskId, TaskPayload, TaskRecord, UploadImage};

#[derive(Debug, thiserror::Error)]
pub enum DistributeError {
    #[error("failed to encode task payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("invalid task payload: {0}")]
    InvalidPayload(String),
    #[error("queue backend rejected task: {0}")]
    Backend(#[from] QueueError),
}

/// Serializes payloads and hands them to the backend.
///
/// Enqueue returns once the backend has stored the task; nothing here waits
/// for execution. Enqueuing the same payload twice produces two tasks.
#[derive(Debug, Clone)]
pub struct TaskDistributor<B> {
    backend: B,
}

impl<B: QueueBackend> TaskDistributor<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn enqueue(
        &self,
        payload: &TaskPayload,
        opts: EnqueueOptions,
    ) -> Result<TaskId, DistributeError> {
        let record = TaskRecord::new(payload, opts)?;
        let task_type = record.task_type.clone();
        let id = self.backend.enqueue(record).await?;
        debug!(
            task_id = %id,
            task_type = %task_type,
            queue = %opts.queue,
            max_retry = opts.max_retry,
            process_in_ms = opts.process_in.as_millis() as u64,
            "task enqueued"
        );
        Ok(id)
    }

    pub async fn enqueue_upload_image(
        &self,
        image: UploadImage,
        opts: EnqueueOptions,
    ) -> Result<TaskId, DistributeError> {
        self.enqueue(&TaskPayload::UploadImage(image), opts).await
    }

    /// One task for the whole batch. An empty batch enqueues nothing.
    pub async fn enqueue_upload_batch(
        &self,
        images: Vec<UploadImage>,
        opts: EnqueueOptions,
    ) -> Result<Option<TaskId>, DistributeError> {
        if images.is_empty() {
            return Ok(None);
        }
        self.enqueue(&TaskPayload::UploadImageBatch(images), opts)
            .await
            .map(Some)
    }

    /// One task deleting every key. Blank keys are dropped; nothing is
    /// enqueued if none remain.
    pub async fn enqueue_delete_objects(
        &self,
        keys: Vec<String>,
        opts: EnqueueOptions,
    ) -> Result<Option<TaskId>, DistributeError> {
        let keys: Vec<String> = keys.into_iter().filter(|k| !k.trim().is_empty()).collect();
        if keys.is_empty() {
            return Ok(None);
        }
        self.enqueue(&TaskPayload::DeleteObjects(keys), opts)
            .await
            .map(Some)
    }

    pub async fn enqueue_verification_mail(
        &self,
        email: &str,
        opts: EnqueueOptions,
    ) -> Result<TaskId, DistributeError> {
        let mail = mail_payload(email)?;
        self.enqueue(&TaskPayload::SendVerificationMail(mail), opts).await
    }

    pub async fn enqueue_reset_password_mail(
        &self,
        email: &str,
        opts: EnqueueOptions,
    ) -> Result<TaskId, DistributeError> {
        let mail = mail_payload(email)?;
        self.enqueue(&TaskPayload::SendResetPasswordMail(mail), opts).await
    }
}

fn mail_payload(email: &str) -> Result<SendMail, DistributeError> {
    let email = email.trim();
    if email.is_empty() {
        return Err(DistributeError::InvalidPayload(
            "mail recipient is empty".to_string(),
        ));
    }
    Ok(SendMail {
        email: email.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::tasks::backend::InMemoryQueueBackend;
    use crate::tasks::types::{QueueClass, TaskKind};

    fn distributor() -> (TaskDistributor<Arc<InMemoryQueueBackend>>, Arc<InMemoryQueueBackend>) {
        let backend = InMemoryQueueBackend::arc();
        (TaskDistributor::new(backend.clone()), backend)
    }

    fn image(key: &str) -> UploadImage {
        UploadImage {
            image: vec![1, 2, 3],
            object_key: key.to_string(),
            extension: "png".to_string(),
        }
    }

    #[tokio::test]
    async fn enqueue_stores_options() {
        let (distributor, backend) = distributor();
        let opts = EnqueueOptions::default()
            .queue(QueueClass::Critical)
            .process_in(Duration::from_secs(2));

        let id = distributor.enqueue_upload_image(image("a.png"), opts).await.unwrap();

        let stored = backend.get(id).await.unwrap().unwrap();
        assert_eq!(stored.kind(), Ok(TaskKind::UploadImage));
        assert_eq!(stored.queue, QueueClass::Critical);
        assert_eq!(stored.max_retry, 3);
    }

    #[tokio::test]
    async fn batch_is_one_task() {
        let (distributor, backend) = distributor();
        let id = distributor
            .enqueue_upload_batch(vec![image("a.png"), image("b.png")], EnqueueOptions::default())
            .await
            .unwrap();

        assert!(id.is_some());
        let all = backend.snapshot();
        assert_eq!(all.len(), 1);
        let TaskPayload::UploadImageBatch(images) = all[0].decode(TaskKind::UploadImageBatch).unwrap() else {
            panic!("wrong payload");
        };
        assert_eq!(images.len(), 2);
    }

    #[tokio::test]
    async fn empty_batches_enqueue_nothing() {
        let (distributor, backend) = distributor();

        let upload = distributor
            .enqueue_upload_batch(Vec::new(), EnqueueOptions::default())
            .await
            .unwrap();
        let delete = distributor
            .enqueue_delete_objects(vec![String::new(), "  ".to_string()], EnqueueOptions::default())
            .await
            .unwrap();

        assert_eq!((upload, delete), (None, None));
        assert!(backend.snapshot().is_empty());
    }

    #[tokio::test]
    async fn duplicate_enqueues_create_distinct_tasks() {
        let (distributor, backend) = distributor();
        let a = distributor
            .enqueue_verification_mail("a@example.com", EnqueueOptions::default())
            .await
            .unwrap();
        let b = distributor
            .enqueue_verification_mail("a@example.com", EnqueueOptions::default())
            .await
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(backend.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn blank_mail_recipient_is_rejected() {
        let (distributor, _) = distributor();
        let err = distributor
            .enqueue_reset_password_mail(" ", EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DistributeError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn backend_failure_surfaces() {
        let (distributor, backend) = distributor();
        backend.fail_next_enqueues(1);

        let err = distributor
            .enqueue_delete_objects(vec!["k".to_string()], EnqueueOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DistributeError::Backend(QueueError::Storage(_))));
    }
}
