//! Bulkmail - bulk email campaign dispatch engine.
//!
//! This library provides shared modules for the two Bulkmail binaries:
//! - `bulkmail-web`: Campaign intake, status queries and test sends
//! - `bulkmail-worker`: Dispatcher that drains campaigns through SMTP
//!
//! ## Architecture
//!
//! ```text
//! API → Intake → campaign_dispatch queue → Worker → Dispatcher → SMTP
//!         │                                            │
//!         └────────────── SQLite (campaigns, recipients, run progress)
//! ```

pub mod config;
pub mod dispatch;
pub mod intake;
pub mod model;
pub mod progress;
pub mod queue;
pub mod store;
pub mod transport;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use dispatch::{BatchLimiter, DispatchError, DispatchSettings, Dispatcher, RunSummary, Throttle};
pub use intake::{extract_emails, CampaignReceipt, CampaignRequest, Intake, IntakeError};
pub use model::{Campaign, CampaignId, CampaignStatus, Recipient, RecipientStatus};
pub use progress::{MemoryProgress, ProgressBoard, ProgressSnapshot, RunProgress, RunState};
pub use queue::{DispatchJob, Publisher, RunQueue, DISPATCH_QUEUE};
pub use store::{CampaignStore, SqliteStore, StoreError};
pub use transport::{Envelope, MessageTransport, SendOutcome, SmtpTransport};
pub use web::AppState;
