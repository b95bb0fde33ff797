//! API endpoint handlers.
//!
//! Campaign creation only validates, persists and enqueues; the handlers
//! never wait on a dispatch run. The test-send endpoint is the one place a
//! request blocks on the transport.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::intake::{CampaignRequest, Intake, IntakeError};
use crate::model::{CampaignId, CampaignStatus};
use crate::progress::{ProgressBoard, RunProgress};
use crate::store::CampaignStore;
use crate::transport::{Envelope, MessageTransport, SendOutcome};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<Intake>,
    pub store: Arc<dyn CampaignStore>,
    pub progress: Arc<dyn ProgressBoard>,
    pub transport: Arc<dyn MessageTransport>,
}

impl AppState {
    pub fn new(
        intake: Intake,
        store: Arc<dyn CampaignStore>,
        progress: Arc<dyn ProgressBoard>,
        transport: Arc<dyn MessageTransport>,
    ) -> Self {
        Self {
            intake: Arc::new(intake),
            store,
            progress,
            transport,
        }
    }
}

/// Error body shared by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn intake_error_response(err: IntakeError) -> Response {
    match err {
        IntakeError::Validation(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        IntakeError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "Campaign not found"),
        IntakeError::Store(e) => {
            error!(error = %e, "api_store_error");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error")
        }
        IntakeError::Enqueue(e) => {
            error!(error = %e, "api_enqueue_error");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to schedule dispatch")
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Campaigns
// =============================================================================

/// Create a campaign and enqueue its dispatch run.
pub async fn create_campaign(
    State(state): State<AppState>,
    Json(request): Json<CampaignRequest>,
) -> Response {
    info!(
        has_sender = request.sender_email.is_some(),
        recipients_length = request.recipients.as_ref().map(|s| s.len()).unwrap_or(0),
        is_html = request.is_html,
        "api_campaign_received"
    );

    match state.intake.create(request).await {
        Ok(receipt) => {
            info!(
                campaign_id = receipt.campaign_id,
                run_id = %receipt.run_id,
                total_recipients = receipt.total_recipients,
                "api_campaign_enqueued"
            );
            (StatusCode::CREATED, Json(receipt)).into_response()
        }
        Err(e) => intake_error_response(e),
    }
}

/// Campaign status body.
#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignStatusResponse {
    pub status: CampaignStatus,
    pub total: u64,
    pub sent: u64,
    pub failed: u64,
}

/// Aggregate status of a campaign.
pub async fn campaign_status(
    State(state): State<AppState>,
    Path(campaign_id): Path<CampaignId>,
) -> Response {
    match state.store.campaign(campaign_id).await {
        Ok(Some(campaign)) => Json(CampaignStatusResponse {
            status: campaign.status,
            total: campaign.total_recipients,
            sent: campaign.emails_sent,
            failed: campaign.emails_failed,
        })
        .into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Campaign not found"),
        Err(e) => {
            error!(campaign_id = campaign_id, error = %e, "api_campaign_status_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error")
        }
    }
}

/// Response for a manually scheduled run.
#[derive(Debug, Serialize)]
pub struct DispatchResponse {
    pub campaign_id: CampaignId,
    pub task_id: String,
}

/// Schedule a fresh run for an existing campaign.
pub async fn dispatch_campaign(
    State(state): State<AppState>,
    Path(campaign_id): Path<CampaignId>,
) -> Response {
    match state.intake.resume(campaign_id).await {
        Ok(run_id) => (
            StatusCode::ACCEPTED,
            Json(DispatchResponse {
                campaign_id,
                task_id: run_id,
            }),
        )
            .into_response(),
        Err(e) => intake_error_response(e),
    }
}

// =============================================================================
// Runs
// =============================================================================

/// Progress of a run.
///
/// Counter fields are only present for in-progress and successful runs.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStatusResponse {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed: Option<u64>,
    pub status: String,
}

impl From<RunProgress> for TaskStatusResponse {
    fn from(progress: RunProgress) -> Self {
        let state = progress.state().as_str().to_string();
        match progress {
            RunProgress::Pending => Self {
                state,
                current: None,
                total: None,
                sent: None,
                failed: None,
                status: "Pending...".to_string(),
            },
            RunProgress::InProgress(s) | RunProgress::Success(s) => Self {
                state,
                current: Some(s.current),
                total: Some(s.total),
                sent: Some(s.sent),
                failed: Some(s.failed),
                status: s.status,
            },
            RunProgress::Failure(reason) => Self {
                state,
                current: None,
                total: None,
                sent: None,
                failed: None,
                status: reason,
            },
        }
    }
}

/// Latest progress snapshot of a run.
pub async fn task_status(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    match state.progress.read(&task_id).await {
        Ok(Some(progress)) => Json(TaskStatusResponse::from(progress)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Task not found"),
        Err(e) => {
            error!(task_id = %task_id, error = %e, "api_task_status_failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Storage error")
        }
    }
}

// =============================================================================
// Test Send
// =============================================================================

/// Single test-send request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestEmailRequest {
    pub sender_email: Option<String>,
    pub sender_name: Option<String>,
    pub recipient_email: Option<String>,
    pub subject: Option<String>,
    pub content: Option<String>,
    #[serde(default)]
    pub is_html: bool,
}

/// Test-send result.
#[derive(Debug, Serialize)]
pub struct TestEmailResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Send one message synchronously, bypassing campaign storage.
pub async fn test_email(
    State(state): State<AppState>,
    Json(request): Json<TestEmailRequest>,
) -> Response {
    let (Some(sender_email), Some(recipient_email), Some(subject), Some(content)) = (
        non_blank(&request.sender_email),
        non_blank(&request.recipient_email),
        non_blank(&request.subject),
        non_blank(&request.content),
    ) else {
        warn!("api_test_email_missing_fields");
        return error_response(StatusCode::BAD_REQUEST, "Missing required fields");
    };

    let envelope = Envelope {
        sender_email,
        sender_name: non_blank(&request.sender_name),
        recipient_email,
        subject,
        body: content,
        is_html: request.is_html,
    };

    match state.transport.send(&envelope).await {
        SendOutcome::Delivered => {
            info!(recipient = %envelope.recipient_email, "api_test_email_sent");
            Json(TestEmailResponse {
                status: "success",
                message: None,
            })
            .into_response()
        }
        SendOutcome::Rejected { reason, class } => {
            warn!(
                recipient = %envelope.recipient_email,
                class = class.as_str(),
                reason = %reason,
                "api_test_email_failed"
            );
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TestEmailResponse {
                    status: "error",
                    message: Some(reason),
                }),
            )
                .into_response()
        }
    }
}
