//! Queue message types.
//!
//! A single queue carries one message per dispatch run.

use serde::{Deserialize, Serialize};

use crate::model::CampaignId;
use crate::progress::RunId;

/// Queue name for campaign dispatch runs.
pub const DISPATCH_QUEUE: &str = "campaign_dispatch";

/// Request to run the dispatcher over one campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchJob {
    /// Run identity; also the AMQP message id
    pub run_id: RunId,
    /// Campaign whose pending recipients the run drains
    pub campaign_id: CampaignId,
}

impl DispatchJob {
    pub fn new(run_id: RunId, campaign_id: CampaignId) -> Self {
        Self {
            run_id,
            campaign_id,
        }
    }
}
