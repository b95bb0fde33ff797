//! Queue module for RabbitMQ operations.
//!
//! This module provides:
//! - The dispatch job message type
//! - The [`RunQueue`] seam intake uses to hand off runs
//! - An async publisher implementing it over RabbitMQ
//!
//! ## Architecture
//!
//! ```text
//! Web Server (intake) → campaign_dispatch queue → Worker (dispatcher)
//! ```

pub mod publisher;
pub mod types;

use anyhow::Result;
use async_trait::async_trait;

pub use publisher::Publisher;
pub use types::{DispatchJob, DISPATCH_QUEUE};

/// Hands dispatch runs to a background worker pool.
///
/// Implementations must deliver each job to at most one worker at a time.
#[async_trait]
pub trait RunQueue: Send + Sync {
    async fn enqueue(&self, job: &DispatchJob) -> Result<()>;
}
