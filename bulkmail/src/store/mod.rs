//! Durable campaign and recipient storage.
//!
//! The dispatcher only talks to the [`CampaignStore`] trait. [`SqliteStore`]
//! is the production implementation and also serves as a cross-process
//! [`ProgressBoard`](crate::progress::ProgressBoard).

pub mod sqlite;

use async_trait::async_trait;

use crate::model::{
    Campaign, CampaignCounters, CampaignId, NewCampaign, Recipient, RecipientId, Resolution,
};

pub use sqlite::SqliteStore;

/// Errors raised by a store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}

/// Result of applying a [`Resolution`] to a recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveOutcome {
    /// False when the recipient was no longer pending and nothing changed
    pub applied: bool,
    /// Campaign counters after the write
    pub counters: CampaignCounters,
}

/// Persistent record of campaigns and their recipients.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Insert a pending campaign and one pending recipient per address, atomically.
    async fn create_campaign(
        &self,
        campaign: NewCampaign,
        recipients: Vec<String>,
    ) -> Result<Campaign, StoreError>;

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError>;

    /// Move a pending campaign to sending and return it. Sending, completed
    /// and failed campaigns keep their status. `None` if the campaign is absent.
    async fn begin_sending(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError>;

    /// Pending recipients of a campaign in insertion order.
    async fn pending_recipients(&self, id: CampaignId) -> Result<Vec<Recipient>, StoreError>;

    /// All recipients of a campaign in insertion order.
    async fn recipients(&self, id: CampaignId) -> Result<Vec<Recipient>, StoreError>;

    /// Advance a pending recipient to its terminal status and bump the matching
    /// campaign counter in one transaction. A recipient that is not pending is
    /// left untouched and nothing is counted.
    async fn resolve_recipient(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        resolution: &Resolution,
    ) -> Result<ResolveOutcome, StoreError>;

    /// Mark a campaign completed unless it has failed.
    async fn mark_completed(&self, id: CampaignId) -> Result<(), StoreError>;

    /// Mark a campaign failed unless it has completed.
    async fn mark_failed(&self, id: CampaignId) -> Result<(), StoreError>;
}
