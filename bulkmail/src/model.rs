//! Campaign and recipient records.
//!
//! These are the durable rows the dispatcher advances. Status values are
//! stored as lowercase strings, matching their serde representation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Row id of a campaign.
pub type CampaignId = i64;

/// Row id of a recipient.
pub type RecipientId = i64;

/// Maximum stored length (in characters) of a recipient's error message.
pub const ERROR_MESSAGE_MAX_LEN: usize = 255;

/// Lifecycle of a campaign. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CampaignStatus {
    Pending,
    Sending,
    Completed,
    /// Campaign-level fatal error. Recipient failures never lead here.
    Failed,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Pending => "pending",
            CampaignStatus::Sending => "sending",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CampaignStatus::Pending),
            "sending" => Ok(CampaignStatus::Sending),
            "completed" => Ok(CampaignStatus::Completed),
            "failed" => Ok(CampaignStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Delivery status of a single recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientStatus {
    Pending,
    Sent,
    Failed,
}

impl RecipientStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientStatus::Pending => "pending",
            RecipientStatus::Sent => "sent",
            RecipientStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RecipientStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecipientStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecipientStatus::Pending),
            "sent" => Ok(RecipientStatus::Sent),
            "failed" => Ok(RecipientStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A status string read back from storage that matches no known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown status value: {0}")]
pub struct UnknownStatus(pub String);

/// One bulk-send job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub sender_email: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub content: String,
    /// Body is HTML rather than plain text
    pub is_html: bool,
    /// RFC 3339 UTC creation time
    pub created_at: String,
    pub status: CampaignStatus,
    pub total_recipients: u64,
    pub emails_sent: u64,
    pub emails_failed: u64,
}

impl Campaign {
    /// Counters for the status query.
    pub fn counters(&self) -> CampaignCounters {
        CampaignCounters {
            sent: self.emails_sent,
            failed: self.emails_failed,
        }
    }
}

/// A campaign as submitted to intake, before it has an id.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub sender_email: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub content: String,
    pub is_html: bool,
}

/// One addressee of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub id: RecipientId,
    pub campaign_id: CampaignId,
    pub email: String,
    pub status: RecipientStatus,
    pub error_message: Option<String>,
}

/// Snapshot of a campaign's aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CampaignCounters {
    pub sent: u64,
    pub failed: u64,
}

/// Terminal outcome of one recipient, as written to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Sent,
    /// Reason already truncated to [`ERROR_MESSAGE_MAX_LEN`]
    Failed { reason: String },
}

impl Resolution {
    pub fn status(&self) -> RecipientStatus {
        match self {
            Resolution::Sent => RecipientStatus::Sent,
            Resolution::Failed { .. } => RecipientStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_campaign_status_round_trips_through_str() {
        for status in [
            CampaignStatus::Pending,
            CampaignStatus::Sending,
            CampaignStatus::Completed,
            CampaignStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<CampaignStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        assert_eq!(
            "bounced".parse::<RecipientStatus>(),
            Err(UnknownStatus("bounced".to_string()))
        );
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&CampaignStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
