//! Campaign intake: validation, address extraction, persistence, enqueue.
//!
//! Validation happens before anything is written, so a rejected request
//! leaves no rows behind.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::model::{CampaignId, NewCampaign};
use crate::progress::{ProgressBoard, RunId};
use crate::queue::{DispatchJob, RunQueue};
use crate::store::{CampaignStore, StoreError};

/// Default cap on recipients per campaign.
pub const DEFAULT_MAX_RECIPIENTS: usize = 5000;

static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}(?:\.[a-zA-Z]{2,})?")
        .expect("email pattern is valid")
});

/// Extract addresses from free text, lowercased and deduplicated.
///
/// Order of first occurrence is kept so recipients are dispatched in the
/// order they were given.
pub fn extract_emails(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    let mut seen = HashSet::new();
    EMAIL_PATTERN
        .find_iter(&lowered)
        .map(|m| m.as_str().to_string())
        .filter(|email| seen.insert(email.clone()))
        .collect()
}

/// Campaign creation request. Every field is optional at the wire level so
/// missing fields surface as a validation error rather than a parse error.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CampaignRequest {
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub recipients: Option<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    #[serde(default)]
    pub is_html: bool,
}

/// What the caller gets back for an accepted campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CampaignReceipt {
    pub campaign_id: CampaignId,
    #[serde(rename = "task_id")]
    pub run_id: RunId,
    pub total_recipients: u64,
}

/// Intake errors.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("{0}")]
    Validation(String),

    #[error("campaign {0} not found")]
    NotFound(CampaignId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to enqueue dispatch run: {0}")]
    Enqueue(anyhow::Error),
}

/// Non-blank trimmed value of a required field.
fn required(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Accepts campaigns and hands them to the dispatch queue.
pub struct Intake {
    store: Arc<dyn CampaignStore>,
    progress: Arc<dyn ProgressBoard>,
    queue: Arc<dyn RunQueue>,
    max_recipients: usize,
}

impl Intake {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        progress: Arc<dyn ProgressBoard>,
        queue: Arc<dyn RunQueue>,
        max_recipients: usize,
    ) -> Self {
        Self {
            store,
            progress,
            queue,
            max_recipients,
        }
    }

    /// Validate a request into the campaign fields and its recipient list.
    pub fn validate(&self, request: &CampaignRequest) -> Result<(NewCampaign, Vec<String>), IntakeError> {
        let (Some(sender_email), Some(recipients), Some(subject), Some(content)) = (
            required(&request.sender_email),
            required(&request.recipients),
            required(&request.subject),
            required(&request.content),
        ) else {
            return Err(IntakeError::Validation("Missing required fields".to_string()));
        };

        let emails = extract_emails(recipients);
        if emails.is_empty() {
            return Err(IntakeError::Validation(
                "No valid email addresses provided".to_string(),
            ));
        }
        if emails.len() > self.max_recipients {
            return Err(IntakeError::Validation(format!(
                "Maximum {} recipients allowed",
                self.max_recipients
            )));
        }

        let campaign = NewCampaign {
            sender_email: sender_email.to_string(),
            sender_name: required(&request.sender_name).map(str::to_string),
            subject: subject.to_string(),
            content: content.to_string(),
            is_html: request.is_html,
        };

        Ok((campaign, emails))
    }

    /// Persist a new campaign and enqueue its first dispatch run.
    pub async fn create(&self, request: CampaignRequest) -> Result<CampaignReceipt, IntakeError> {
        let (campaign, emails) = match self.validate(&request) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "intake_validation_failed");
                return Err(e);
            }
        };

        let campaign = self.store.create_campaign(campaign, emails).await?;
        info!(
            campaign_id = campaign.id,
            total_recipients = campaign.total_recipients,
            is_html = campaign.is_html,
            "intake_campaign_created"
        );

        let run_id = self.enqueue_run(campaign.id).await?;

        Ok(CampaignReceipt {
            campaign_id: campaign.id,
            run_id,
            total_recipients: campaign.total_recipients,
        })
    }

    /// Enqueue a fresh run for an existing campaign.
    ///
    /// Used to recover a campaign whose run died part way; the new run only
    /// touches recipients that are still pending.
    pub async fn resume(&self, campaign_id: CampaignId) -> Result<RunId, IntakeError> {
        if self.store.campaign(campaign_id).await?.is_none() {
            return Err(IntakeError::NotFound(campaign_id));
        }
        let run_id = self.enqueue_run(campaign_id).await?;
        info!(campaign_id = campaign_id, run_id = %run_id, "intake_campaign_resumed");
        Ok(run_id)
    }

    async fn enqueue_run(&self, campaign_id: CampaignId) -> Result<RunId, IntakeError> {
        let run_id = Uuid::new_v4().to_string();
        self.progress.register(&run_id).await?;

        let job = DispatchJob::new(run_id.clone(), campaign_id);
        if let Err(e) = self.queue.enqueue(&job).await {
            error!(campaign_id = campaign_id, run_id = %run_id, error = %e, "intake_enqueue_failed");
            return Err(IntakeError::Enqueue(e));
        }

        Ok(run_id)
    }
}
