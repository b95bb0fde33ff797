//! Turning transport outcomes into stored recipient resolutions.

use crate::model::Resolution;
use crate::transport::SendOutcome;

/// Stored when a transport rejects without saying why.
const UNKNOWN_REASON: &str = "unknown transport error";

/// Cut `reason` to at most `max_chars` characters, on a char boundary.
pub fn truncate_reason(reason: &str, max_chars: usize) -> String {
    match reason.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => reason[..byte_idx].to_string(),
        None => reason.to_string(),
    }
}

/// Resolution to store for a send outcome. Failure reasons are truncated to
/// `max_chars`.
pub fn resolve(outcome: &SendOutcome, max_chars: usize) -> Resolution {
    match outcome {
        SendOutcome::Delivered => Resolution::Sent,
        SendOutcome::Rejected { reason, .. } => {
            let reason = reason.trim();
            let reason = if reason.is_empty() {
                UNKNOWN_REASON
            } else {
                reason
            };
            Resolution::Failed {
                reason: truncate_reason(reason, max_chars),
            }
        }
    }
}
