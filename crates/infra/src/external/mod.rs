//! Adapters for external services reached from task handlers.
//!
//! Gateways make exactly one attempt per call. Retrying is the task
//! processor's job.

pub mod mail;
pub mod object_store;

pub use mail::{InMemoryMailer, MailMessage, MailTransport, SmtpMailer};
pub use object_store::{InMemoryObjectStore, ObjectStore, S3ObjectStore, StoredObject};

/// Failure talking to an external service. Everything except `Rejected` is
/// worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unexpected status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("service unavailable: {0}")]
    Unavailable(String),
    /// The service (or local validation) refused the request for good.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, GatewayError::Rejected(_))
    }
}
