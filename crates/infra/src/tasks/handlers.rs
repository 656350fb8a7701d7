//! Handlers for every [`TaskKind`].
//!
//! All handlers are safe to run more than once for the same payload:
//! uploads overwrite by key and deleting a missing key succeeds. Mail is the
//! exception; a redelivered mail task sends the message again.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use coffeeshop_core::UserId;
use coffeeshop_products::ImageFormat;

use crate::db::UserDirectory;
use crate::external::{GatewayError, MailMessage, MailTransport, ObjectStore};

use super::processor::{HandlerRegistry, TaskHandler};
use super::types::{TaskError, TaskKind, TaskPayload, TaskRecord, UploadImage};

impl From<GatewayError> for TaskError {
    fn from(err: GatewayError) -> Self {
        if err.is_permanent() {
            TaskError::Fatal(err.to_string())
        } else {
            TaskError::Transient(err.to_string())
        }
    }
}

fn decode(task: &TaskRecord, kind: TaskKind) -> Result<TaskPayload, TaskError> {
    task.decode(kind)
        .map_err(|e| TaskError::fatal(format!("undecodable {kind} payload: {e}")))
}

async fn upload(store: &dyn ObjectStore, image: UploadImage) -> Result<(), TaskError> {
    if image.object_key.trim().is_empty() {
        return Err(TaskError::fatal("upload has an empty object key"));
    }
    let format = ImageFormat::from_extension(&image.extension).ok_or_else(|| {
        TaskError::fatal(format!("unsupported image extension {:?}", image.extension))
    })?;
    let content_type = format.content_type();
    let size = image.image.len();
    store.put(&image.object_key, image.image, &content_type).await?;
    debug!(object_key = %image.object_key, bytes = size, "object uploaded");
    Ok(())
}

/// `upload_s3_object`
pub struct UploadImageHandler {
    store: Arc<dyn ObjectStore>,
}

impl UploadImageHandler {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for UploadImageHandler {
    async fn handle(&self, task: &TaskRecord) -> Result<(), TaskError> {
        match decode(task, TaskKind::UploadImage)? {
            TaskPayload::UploadImage(image) => upload(self.store.as_ref(), image).await,
            _ => Err(TaskError::fatal("payload does not match task type")),
        }
    }
}

/// `upload_multiple_s3_objects`. Any failed upload fails the whole batch;
/// the retry re-puts the objects that already made it.
pub struct UploadImageBatchHandler {
    store: Arc<dyn ObjectStore>,
}

impl UploadImageBatchHandler {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for UploadImageBatchHandler {
    async fn handle(&self, task: &TaskRecord) -> Result<(), TaskError> {
        let TaskPayload::UploadImageBatch(images) = decode(task, TaskKind::UploadImageBatch)? else {
            return Err(TaskError::fatal("payload does not match task type"));
        };
        for image in images {
            upload(self.store.as_ref(), image).await?;
        }
        Ok(())
    }
}

/// `delete_s3_object`
pub struct DeleteObjectsHandler {
    store: Arc<dyn ObjectStore>,
}

impl DeleteObjectsHandler {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskHandler for DeleteObjectsHandler {
    async fn handle(&self, task: &TaskRecord) -> Result<(), TaskError> {
        let TaskPayload::DeleteObjects(keys) = decode(task, TaskKind::DeleteObjects)? else {
            return Err(TaskError::fatal("payload does not match task type"));
        };
        for key in keys.iter().filter(|k| !k.trim().is_empty()) {
            self.store.delete(key).await?;
        }
        debug!(task_id = %task.id, count = keys.len(), "objects deleted");
        Ok(())
    }
}

/// Where mail links point and how long they stay valid.
#[derive(Debug, Clone)]
pub struct MailLinks {
    pub base_url: String,
    pub ttl: Duration,
}

impl Default for MailLinks {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            ttl: Duration::from_secs(2880 * 60),
        }
    }
}

impl MailLinks {
    fn link(&self, path: &str, user: UserId) -> String {
        let expires_at = Utc::now() + super::types::to_chrono(self.ttl);
        format!(
            "{}/{}?token={}&timestamp={}",
            self.base_url.trim_end_matches('/'),
            path,
            user,
            expires_at.timestamp_millis()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MailKind {
    Verification,
    ResetPassword,
}

impl MailKind {
    fn task_kind(self) -> TaskKind {
        match self {
            MailKind::Verification => TaskKind::SendVerificationMail,
            MailKind::ResetPassword => TaskKind::SendResetPasswordMail,
        }
    }
}

/// `send_verification_mail` and `send_reset_password_mail`.
///
/// Unknown recipients are fatal: the account is gone and retrying will not
/// bring it back.
pub struct MailHandler {
    kind: MailKind,
    users: Arc<dyn UserDirectory>,
    mailer: Arc<dyn MailTransport>,
    links: MailLinks,
}

impl MailHandler {
    pub fn verification(
        users: Arc<dyn UserDirectory>,
        mailer: Arc<dyn MailTransport>,
        links: MailLinks,
    ) -> Self {
        Self {
            kind: MailKind::Verification,
            users,
            mailer,
            links,
        }
    }

    pub fn reset_password(
        users: Arc<dyn UserDirectory>,
        mailer: Arc<dyn MailTransport>,
        links: MailLinks,
    ) -> Self {
        Self {
            kind: MailKind::ResetPassword,
            users,
            mailer,
            links,
        }
    }

    fn compose(&self, to: String, user: UserId) -> MailMessage {
        match self.kind {
            MailKind::Verification => MailMessage {
                to,
                subject: "Verify your email address".to_string(),
                body: format!(
                    "Welcome to the coffee shop!\n\nConfirm your email address here:\n{}\n\nThe link expires in 48 hours.",
                    self.links.link("verify", user)
                ),
            },
            MailKind::ResetPassword => MailMessage {
                to,
                subject: "Reset your password".to_string(),
                body: format!(
                    "Someone asked to reset the password for this account.\n\nChoose a new password here:\n{}\n\nIf that was not you, ignore this message.",
                    self.links.link("resetpassword", user)
                ),
            },
        }
    }
}

#[async_trait]
impl TaskHandler for MailHandler {
    async fn handle(&self, task: &TaskRecord) -> Result<(), TaskError> {
        let mail = match decode(task, self.kind.task_kind())? {
            TaskPayload::SendVerificationMail(mail) | TaskPayload::SendResetPasswordMail(mail) => {
                mail
            }
            _ => return Err(TaskError::fatal("payload does not match task type")),
        };

        let user = self
            .users
            .find_by_email(&mail.email)
            .await
            .map_err(|e| TaskError::transient(e.to_string()))?
            .ok_or_else(|| TaskError::fatal(format!("no user registered for {}", mail.email)))?;

        let message = self.compose(mail.email, user);
        self.mailer.send(&message).await?;
        info!(task_id = %task.id, user_id = %user, kind = ?self.kind, "mail sent");
        Ok(())
    }
}

/// Dispatch table with a handler for every task kind.
pub fn standard_registry(
    objects: Arc<dyn ObjectStore>,
    users: Arc<dyn UserDirectory>,
    mailer: Arc<dyn MailTransport>,
    links: MailLinks,
) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(
            TaskKind::UploadImage,
            Arc::new(UploadImageHandler::new(objects.clone())),
        )
        .register(
            TaskKind::UploadImageBatch,
            Arc::new(UploadImageBatchHandler::new(objects.clone())),
        )
        .register(
            TaskKind::DeleteObjects,
            Arc::new(DeleteObjectsHandler::new(objects)),
        )
        .register(
            TaskKind::SendVerificationMail,
            Arc::new(MailHandler::verification(
                users.clone(),
                mailer.clone(),
                links.clone(),
            )),
        )
        .register(
            TaskKind::SendResetPasswordMail,
            Arc::new(MailHandler::reset_password(users, mailer, links)),
        )
}
