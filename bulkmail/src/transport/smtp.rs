//! SMTP transport built on lettre.
//!
//! Sessions are always encrypted (STARTTLS or implicit TLS) and
//! authenticated. Connections are pooled by lettre and reused across sends.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, Error as SmtpError},
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{info, warn};

use super::{Envelope, FailureClass, MessageTransport, SendOutcome};

/// How the SMTP session is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Plain connect, then upgrade with STARTTLS (port 587)
    StartTls,
    /// TLS from the first byte (port 465)
    Wrapper,
}

impl FromStr for TlsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "starttls" => Ok(TlsMode::StartTls),
            "wrapper" | "tls" | "smtps" => Ok(TlsMode::Wrapper),
            other => Err(format!("unknown SMTP TLS mode: {}", other)),
        }
    }
}

/// Connection settings for the SMTP relay.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: TlsMode,
    pub timeout: Duration,
}

/// [`MessageTransport`] that relays through an authenticated SMTP server.
#[derive(Clone)]
pub struct SmtpTransport {
    mailer: AsyncSmtpTransport<Tokio1Executor>,
    host: String,
}

impl SmtpTransport {
    /// Build the transport. No connection is made until the first send.
    pub fn new(settings: &SmtpSettings) -> Result<Self, SmtpError> {
        let builder = match settings.tls {
            TlsMode::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)?
            }
            TlsMode::Wrapper => AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.host)?,
        };

        let mailer = builder
            .port(settings.port)
            .credentials(Credentials::new(
                settings.username.clone(),
                settings.password.clone(),
            ))
            .timeout(Some(settings.timeout))
            .build();

        info!(
            host = %settings.host,
            port = settings.port,
            tls = ?settings.tls,
            "smtp_transport_created"
        );

        Ok(Self {
            mailer,
            host: settings.host.clone(),
        })
    }
}

/// Build the MIME message for an envelope.
///
/// The `From` header carries the display name when one is given.
pub fn build_message(envelope: &Envelope) -> Result<Message, String> {
    let sender: Address = envelope
        .sender_email
        .trim()
        .parse()
        .map_err(|e| format!("invalid sender address: {}", e))?;
    let recipient: Address = envelope
        .recipient_email
        .trim()
        .parse()
        .map_err(|e| format!("invalid recipient address: {}", e))?;

    let sender_name = envelope
        .sender_name
        .as_ref()
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty());

    let content_type = if envelope.is_html {
        ContentType::TEXT_HTML
    } else {
        ContentType::TEXT_PLAIN
    };

    Message::builder()
        .from(Mailbox::new(sender_name, sender))
        .to(Mailbox::new(None, recipient))
        .subject(envelope.subject.clone())
        .header(content_type)
        .body(envelope.body.clone())
        .map_err(|e| format!("failed to build message: {}", e))
}

/// Map an SMTP error to a retry class.
fn classify(err: &SmtpError) -> FailureClass {
    if err.is_permanent() {
        FailureClass::Permanent
    } else if err.is_transient() {
        FailureClass::Transient
    } else {
        FailureClass::Unknown
    }
}

#[async_trait]
impl MessageTransport for SmtpTransport {
    async fn send(&self, envelope: &Envelope) -> SendOutcome {
        let message = match build_message(envelope) {
            Ok(m) => m,
            Err(reason) => {
                warn!(
                    recipient = %envelope.recipient_email,
                    reason = %reason,
                    "smtp_message_invalid"
                );
                return SendOutcome::rejected(reason, FailureClass::Permanent);
            }
        };

        match self.mailer.send(message).await {
            Ok(response) => {
                info!(
                    host = %self.host,
                    recipient = %envelope.recipient_email,
                    code = %response.code(),
                    "smtp_send_accepted"
                );
                SendOutcome::Delivered
            }
            Err(e) => {
                let class = classify(&e);
                warn!(
                    host = %self.host,
                    recipient = %envelope.recipient_email,
                    class = class.as_str(),
                    error = %e,
                    "smtp_send_failed"
                );
                SendOutcome::rejected(e.to_string(), class)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> Envelope {
        Envelope {
            sender_email: "news@example.com".to_string(),
            sender_name: Some("Example News".to_string()),
            recipient_email: "reader@example.org".to_string(),
            subject: "Hello".to_string(),
            body: "<p>Hi</p>".to_string(),
            is_html: true,
        }
    }

    fn settings() -> SmtpSettings {
        SmtpSettings {
            host: "localhost".to_string(),
            port: 587,
            username: "user".to_string(),
            password: "secret".to_string(),
            tls: TlsMode::StartTls,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_tls_mode_parse() {
        assert_eq!("starttls".parse::<TlsMode>(), Ok(TlsMode::StartTls));
        assert_eq!(" Wrapper ".parse::<TlsMode>(), Ok(TlsMode::Wrapper));
        assert!("none".parse::<TlsMode>().is_err());
    }

    #[test]
    fn test_build_message_html() {
        let message = build_message(&envelope()).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("news@example.com"));
        assert!(raw.contains("Example News"));
        assert!(raw.contains("reader@example.org"));
        assert!(raw.contains("text/html"));
    }

    #[test]
    fn test_build_message_plain_without_name() {
        let mut env = envelope();
        env.sender_name = None;
        env.is_html = false;

        let message = build_message(&env).unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("text/plain"));
        assert!(!raw.contains("Example News"));
    }

    #[test]
    fn test_build_message_rejects_bad_recipient() {
        let mut env = envelope();
        env.recipient_email = "not-an-address".to_string();

        let err = build_message(&env).unwrap_err();
        assert!(err.starts_with("invalid recipient address"));
    }

    #[tokio::test]
    async fn test_invalid_sender_is_permanent_rejection() {
        let transport = SmtpTransport::new(&settings()).unwrap();
        let mut env = envelope();
        env.sender_email = "broken".to_string();

        match transport.send(&env).await {
            SendOutcome::Rejected { reason, class } => {
                assert!(reason.starts_with("invalid sender address"));
                assert_eq!(class, FailureClass::Permanent);
            }
            SendOutcome::Delivered => panic!("Expected rejection"),
        }
    }
}
