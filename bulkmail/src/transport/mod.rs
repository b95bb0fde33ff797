//! Message transport abstraction.
//!
//! A transport performs one send attempt for one recipient and reports the
//! outcome as data. It never fails the caller: every problem, including a
//! malformed address, comes back as [`SendOutcome::Rejected`].

pub mod smtp;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use smtp::{SmtpSettings, SmtpTransport, TlsMode};

/// Everything needed to send one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub sender_email: String,
    pub sender_name: Option<String>,
    pub recipient_email: String,
    pub subject: String,
    pub body: String,
    pub is_html: bool,
}

/// How likely a rejected send is to succeed on a later attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// 4xx reply, timeout or connection trouble
    Transient,
    /// 5xx reply or an unusable message
    Permanent,
    Unknown,
}

impl FailureClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureClass::Transient => "transient",
            FailureClass::Permanent => "permanent",
            FailureClass::Unknown => "unknown",
        }
    }
}

/// Result of a single send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Rejected { reason: String, class: FailureClass },
}

impl SendOutcome {
    pub fn rejected(reason: impl Into<String>, class: FailureClass) -> Self {
        SendOutcome::Rejected {
            reason: reason.into(),
            class,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}

/// Delivers one message per call.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, envelope: &Envelope) -> SendOutcome;
}
