use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use super::GatewayError;
use crate::config::{MailConfig, SmtpSecurity};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Outbound mail. No deduplication: sending twice delivers twice.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), GatewayError>;
}

/// Collects messages instead of sending them.
#[derive(Debug, Default)]
pub struct InMemoryMailer {
    outbox: RwLock<Vec<MailMessage>>,
    failing_sends: AtomicUsize,
}

impl InMemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, n: usize) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    pub fn outbox(&self) -> Vec<MailMessage> {
        self.outbox.read().map(|o| o.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl MailTransport for InMemoryMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), GatewayError> {
        if self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GatewayError::Unavailable("injected mail failure".to_string()));
        }
        self.outbox
            .write()
            .map_err(|_| GatewayError::Unavailable("outbox lock poisoned".to_string()))?
            .push(message.clone());
        Ok(())
    }
}

/// Sends plain-text mail over SMTP.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: Mailbox,
}

impl std::fmt::Debug for SmtpMailer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpMailer")
            .field("sender", &self.sender.to_string())
            .finish_non_exhaustive()
    }
}

impl SmtpMailer {
    /// Build the transport. No connection is opened until the first send.
    pub fn new(config: &MailConfig) -> Result<Self, GatewayError> {
        let sender: Mailbox = config
            .sender
            .parse()
            .map_err(|e| GatewayError::Rejected(format!("invalid sender {:?}: {e}", config.sender)))?;

        let host = config.smtp_host.as_str();
        let builder = match config.security {
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(host).map_err(smtp_error)?,
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(smtp_error)?
            }
            SmtpSecurity::Opportunistic => {
                let params = TlsParameters::new(host.to_string()).map_err(smtp_error)?;
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                    .tls(Tls::Opportunistic(params))
            }
            SmtpSecurity::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host),
        };
        let mut builder = builder
            .port(config.smtp_port)
            .timeout(Some(config.request_timeout));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(
                username.clone(),
                password.expose().to_string(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            sender,
        })
    }

    fn compose(&self, message: &MailMessage) -> Result<Message, GatewayError> {
        let to: Mailbox = message
            .to
            .parse()
            .map_err(|e| GatewayError::Rejected(format!("invalid recipient {:?}: {e}", message.to)))?;
        Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(message.subject.as_str())
            .header(ContentType::TEXT_PLAIN)
            .body(message.body.clone())
            .map_err(|e| GatewayError::Rejected(format!("cannot build message: {e}")))
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send(&self, message: &MailMessage) -> Result<(), GatewayError> {
        let email = self.compose(message)?;
        self.transport.send(email).await.map_err(smtp_error)?;
        Ok(())
    }
}

/// 5xx replies are permanent; everything else (4xx, I/O, timeouts, TLS) may
/// succeed on a later attempt.
fn smtp_error(err: smtp::Error) -> GatewayError {
    if err.is_permanent() {
        GatewayError::Rejected(format!("smtp: {err}"))
    } else {
        GatewayError::Transport(format!("smtp: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::tasks::MailLinks;

    fn message() -> MailMessage {
        MailMessage {
            to: "ana@example.com".to_string(),
            subject: "hi".to_string(),
            body: "hello".to_string(),
        }
    }

    #[tokio::test]
    async fn duplicate_sends_are_delivered_twice() {
        let mailer = InMemoryMailer::new();
        mailer.send(&message()).await.unwrap();
        mailer.send(&message()).await.unwrap();
        assert_eq!(mailer.outbox().len(), 2);
    }

    #[tokio::test]
    async fn injected_failure_sends_nothing() {
        let mailer = InMemoryMailer::new();
        mailer.fail_next(1);
        assert!(mailer.send(&message()).await.is_err());
        assert!(mailer.outbox().is_empty());
    }

    fn smtp_config(port: u16) -> MailConfig {
        MailConfig {
            smtp_host: "127.0.0.1".to_string(),
            smtp_port: port,
            security: SmtpSecurity::None,
            username: None,
            password: None,
            sender: "no-reply@coffeeshop.local".to_string(),
            links: MailLinks::default(),
            request_timeout: Duration::from_secs(5),
        }
    }

    /// Minimal SMTP peer for one session. `rcpt_reply` answers `RCPT TO`;
    /// returns the client's lines.
    async fn one_shot_smtp(rcpt_reply: &'static str) -> (u16, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (reader, mut writer) = socket.into_split();
            let mut lines = BufReader::new(reader).lines();
            writer.write_all(b"220 localhost ESMTP\r\n").await.unwrap();

            let mut transcript = Vec::new();
            let mut in_data = false;
            while let Some(line) = lines.next_line().await.unwrap() {
                transcript.push(line.clone());
                if in_data {
                    if line == "." {
                        writer.write_all(b"250 queued\r\n").await.unwrap();
                        break;
                    }
                    continue;
                }
                let command = line.to_ascii_uppercase();
                let reply = if command.starts_with("EHLO") {
                    "250 localhost"
                } else if command.starts_with("RCPT") {
                    rcpt_reply
                } else if command.starts_with("DATA") {
                    in_data = true;
                    "354 end with <CRLF>.<CRLF>"
                } else {
                    "250 ok"
                };
                writer.write_all(format!("{reply}\r\n").as_bytes()).await.unwrap();
                if command.starts_with("RCPT") && rcpt_reply.starts_with('5') {
                    break;
                }
            }
            transcript
        });
        (port, server)
    }

    #[tokio::test]
    async fn smtp_session_delivers_plain_text() {
        let (port, server) = one_shot_smtp("250 ok").await;
        let mailer = SmtpMailer::new(&smtp_config(port)).unwrap();

        mailer.send(&message()).await.unwrap();

        let transcript = server.await.unwrap();
        assert!(transcript.iter().any(|l| l == "MAIL FROM:<no-reply@coffeeshop.local>"));
        assert!(transcript.iter().any(|l| l == "RCPT TO:<ana@example.com>"));
        assert!(transcript.iter().any(|l| l == "Subject: hi"));
        assert!(transcript.iter().any(|l| l.starts_with("Content-Type: text/plain")));
        assert!(transcript.iter().any(|l| l == "hello"));
    }

    #[tokio::test]
    async fn refused_recipient_is_permanent() {
        let (port, _server) = one_shot_smtp("550 no such user").await;
        let mailer = SmtpMailer::new(&smtp_config(port)).unwrap();

        let err = mailer.send(&message()).await.unwrap_err();
        assert!(err.is_permanent(), "{err:?}");
    }

    #[tokio::test]
    async fn malformed_recipient_is_rejected_before_connecting() {
        // Nothing listens on the discard port; composing must fail first.
        let mailer = SmtpMailer::new(&smtp_config(9)).unwrap();
        let message = MailMessage {
            to: "not an address".to_string(),
            ..message()
        };

        let err = mailer.send(&message).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)), "{err:?}");
    }

    #[test]
    fn malformed_sender_fails_construction() {
        let config = MailConfig {
            sender: "coffeeshop".to_string(),
            ..smtp_config(25)
        };
        assert!(matches!(SmtpMailer::new(&config), Err(GatewayError::Rejected(_))));
    }
}
