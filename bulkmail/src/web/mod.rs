//! Web server module for the campaign API.
//!
//! This module provides a thin HTTP layer that:
//! - Accepts campaigns and hands them to intake
//! - Answers campaign and run status queries
//! - Sends single test messages synchronously
//!
//! Dispatch itself happens in the background worker.

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub use handlers::{
    campaign_status, create_campaign, dispatch_campaign, health, task_status, test_email,
    AppState, ErrorResponse, HealthResponse, TaskStatusResponse, TestEmailRequest,
};

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/campaigns", post(create_campaign))
        .route("/api/campaigns/:id/status", get(campaign_status))
        .route("/api/campaigns/:id/dispatch", post(dispatch_campaign))
        .route("/api/tasks/:task_id", get(task_status))
        .route("/api/test-email", post(test_email))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
