//! Campaign dispatcher - the per-campaign send loop.
//!
//! One run drains a campaign's pending recipients:
//!
//! ```text
//! begin_sending → pending_recipients → [acquire → send → resolve → publish]* → mark_completed
//! ```
//!
//! Each recipient is advanced from pending to sent/failed exactly once, in
//! the same transaction that bumps the campaign counter. A run only selects
//! pending recipients, so re-running a campaign resumes where a previous run
//! stopped. A crash after the transport accepted a message but before the
//! store write will re-send to that recipient on resume.

pub mod limiter;
pub mod outcome;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::model::{Campaign, CampaignCounters, CampaignId, CampaignStatus, Recipient, ERROR_MESSAGE_MAX_LEN};
use crate::progress::{ProgressBoard, ProgressSnapshot, RunProgress};
use crate::store::{CampaignStore, StoreError};
use crate::transport::{Envelope, MessageTransport, SendOutcome};

pub use limiter::{BatchLimiter, Throttle};
pub use outcome::{resolve, truncate_reason};

/// Failure message published for a run whose campaign does not exist.
pub const CAMPAIGN_NOT_FOUND: &str = "Campaign not found";

/// Tuning for a dispatch run.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Recipients per batch; zero disables batching
    pub batch_size: usize,
    /// Pause between batches
    pub batch_delay: Duration,
    /// Recipients processed concurrently within one run
    pub concurrency: usize,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 50,
            batch_delay: Duration::from_secs(10),
            concurrency: 1,
        }
    }
}

/// Terminal summary of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Pending recipients at the start of the run
    pub total: u64,
    /// Campaign-wide sent counter at the end of the run
    pub sent: u64,
    /// Campaign-wide failed counter at the end of the run
    pub failed: u64,
    /// Recipients left pending because of an unexpected error
    pub skipped: u64,
}

/// Run-level errors. Recipient failures are never reported here.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("campaign {0} not found")]
    CampaignNotFound(CampaignId),

    #[error("campaign {0} has failed and cannot be dispatched")]
    CampaignFailed(CampaignId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mutable state of a run, shared by concurrent recipient tasks.
struct RunTally {
    processed: u64,
    skipped: u64,
    counters: CampaignCounters,
}

/// Drives dispatch runs against a store, a transport and a progress board.
pub struct Dispatcher {
    store: Arc<dyn CampaignStore>,
    transport: Arc<dyn MessageTransport>,
    progress: Arc<dyn ProgressBoard>,
    settings: DispatchSettings,
    limiter: Option<Arc<dyn Throttle>>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn CampaignStore>,
        transport: Arc<dyn MessageTransport>,
        progress: Arc<dyn ProgressBoard>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            transport,
            progress,
            settings,
            limiter: None,
        }
    }

    /// Share one limiter across every run instead of a fresh batcher per run.
    pub fn with_limiter(mut self, limiter: Arc<dyn Throttle>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    fn limiter_for_run(&self) -> Arc<dyn Throttle> {
        match &self.limiter {
            Some(shared) => Arc::clone(shared),
            None => Arc::new(BatchLimiter::new(
                self.settings.batch_size,
                self.settings.batch_delay,
            )),
        }
    }

    /// Publish progress. Failures are logged and never abort the run.
    async fn publish(&self, run_id: &str, progress: RunProgress) {
        if let Err(e) = self.progress.publish(run_id, progress).await {
            warn!(run_id = %run_id, error = %e, "dispatch_progress_publish_failed");
        }
    }

    /// Execute one run over the campaign's pending recipients.
    pub async fn run(
        &self,
        run_id: &str,
        campaign_id: CampaignId,
    ) -> Result<RunSummary, DispatchError> {
        info!(run_id = %run_id, campaign_id = campaign_id, "dispatch_run_starting");

        let campaign = match self.store.begin_sending(campaign_id).await {
            Ok(Some(campaign)) => campaign,
            Ok(None) => {
                warn!(run_id = %run_id, campaign_id = campaign_id, "dispatch_campaign_not_found");
                self.publish(run_id, RunProgress::Failure(CAMPAIGN_NOT_FOUND.to_string()))
                    .await;
                return Err(DispatchError::CampaignNotFound(campaign_id));
            }
            Err(e) => {
                error!(run_id = %run_id, campaign_id = campaign_id, error = %e, "dispatch_campaign_load_failed");
                self.publish(run_id, RunProgress::Failure(e.to_string())).await;
                return Err(e.into());
            }
        };

        if campaign.status == CampaignStatus::Failed {
            warn!(run_id = %run_id, campaign_id = campaign_id, "dispatch_campaign_already_failed");
            let err = DispatchError::CampaignFailed(campaign_id);
            self.publish(run_id, RunProgress::Failure(err.to_string())).await;
            return Err(err);
        }

        let recipients = match self.store.pending_recipients(campaign_id).await {
            Ok(recipients) => recipients,
            Err(e) => {
                error!(run_id = %run_id, campaign_id = campaign_id, error = %e, "dispatch_recipients_load_failed");
                if let Err(mark_err) = self.store.mark_failed(campaign_id).await {
                    error!(campaign_id = campaign_id, error = %mark_err, "dispatch_mark_failed_failed");
                }
                self.publish(run_id, RunProgress::Failure(e.to_string())).await;
                return Err(e.into());
            }
        };

        let total = recipients.len() as u64;
        info!(
            run_id = %run_id,
            campaign_id = campaign_id,
            total = total,
            already_sent = campaign.emails_sent,
            already_failed = campaign.emails_failed,
            concurrency = self.settings.concurrency,
            "dispatch_recipients_loaded"
        );

        let limiter = self.limiter_for_run();
        let tally = Mutex::new(RunTally {
            processed: 0,
            skipped: 0,
            counters: campaign.counters(),
        });

        {
            let campaign = &campaign;
            let tally = &tally;
            let limiter = limiter.as_ref();
            futures::stream::iter(recipients.into_iter().enumerate())
                .for_each_concurrent(self.settings.concurrency.max(1), |(index, recipient)| async move {
                    self.process_recipient(run_id, campaign, index as u64, recipient, total, limiter, tally)
                        .await
                })
                .await;
        }

        let tally = tally.into_inner();

        if let Err(e) = self.store.mark_completed(campaign_id).await {
            error!(run_id = %run_id, campaign_id = campaign_id, error = %e, "dispatch_mark_completed_failed");
            self.publish(run_id, RunProgress::Failure(e.to_string())).await;
            return Err(e.into());
        }

        let summary = RunSummary {
            total,
            sent: tally.counters.sent,
            failed: tally.counters.failed,
            skipped: tally.skipped,
        };

        self.publish(
            run_id,
            RunProgress::Success(ProgressSnapshot::completed(total, summary.sent, summary.failed)),
        )
        .await;

        info!(
            run_id = %run_id,
            campaign_id = campaign_id,
            total = summary.total,
            sent = summary.sent,
            failed = summary.failed,
            skipped = summary.skipped,
            "dispatch_run_completed"
        );

        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_recipient(
        &self,
        run_id: &str,
        campaign: &Campaign,
        index: u64,
        recipient: Recipient,
        total: u64,
        limiter: &dyn Throttle,
        tally: &Mutex<RunTally>,
    ) {
        limiter.acquire(index).await;

        let envelope = Envelope {
            sender_email: campaign.sender_email.clone(),
            sender_name: campaign.sender_name.clone(),
            recipient_email: recipient.email.clone(),
            subject: campaign.subject.clone(),
            body: campaign.content.clone(),
            is_html: campaign.is_html,
        };

        let outcome = self.transport.send(&envelope).await;
        match &outcome {
            SendOutcome::Delivered => debug!(
                run_id = %run_id,
                recipient_id = recipient.id,
                "dispatch_recipient_sent"
            ),
            SendOutcome::Rejected { reason, class } => warn!(
                run_id = %run_id,
                recipient_id = recipient.id,
                recipient = %recipient.email,
                class = class.as_str(),
                reason = %reason,
                "dispatch_recipient_failed"
            ),
        }

        let resolution = resolve(&outcome, ERROR_MESSAGE_MAX_LEN);
        match self
            .store
            .resolve_recipient(campaign.id, recipient.id, &resolution)
            .await
        {
            Ok(resolved) => {
                if !resolved.applied {
                    warn!(
                        run_id = %run_id,
                        recipient_id = recipient.id,
                        "dispatch_recipient_already_resolved"
                    );
                }

                let mut tally = tally.lock().await;
                tally.processed += 1;
                tally.counters.sent = tally.counters.sent.max(resolved.counters.sent);
                tally.counters.failed = tally.counters.failed.max(resolved.counters.failed);

                let snapshot = ProgressSnapshot::step(
                    tally.processed,
                    total,
                    tally.counters.sent,
                    tally.counters.failed,
                );
                // Published under the lock so snapshots never move backwards.
                self.publish(run_id, RunProgress::InProgress(snapshot)).await;
            }
            Err(e) => {
                // The recipient stays pending and is picked up by the next run.
                error!(
                    run_id = %run_id,
                    recipient_id = recipient.id,
                    error = %e,
                    "dispatch_recipient_error"
                );
                tally.lock().await.skipped += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use async_trait::async_trait;

    use crate::model::{NewCampaign, RecipientId, RecipientStatus, Resolution};
    use crate::progress::{MemoryProgress, RunState};
    use crate::store::{ResolveOutcome, SqliteStore};
    use crate::transport::FailureClass;

    /// Transport that records every recipient and rejects a fixed set.
    #[derive(Default)]
    struct FakeTransport {
        rejects: HashSet<String>,
        reason: String,
        sent: std::sync::Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn rejecting(addresses: &[&str], reason: &str) -> Self {
            Self {
                rejects: addresses.iter().map(|a| a.to_string()).collect(),
                reason: reason.to_string(),
                sent: Default::default(),
            }
        }

        fn attempts(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MessageTransport for FakeTransport {
        async fn send(&self, envelope: &Envelope) -> SendOutcome {
            self.sent.lock().unwrap().push(envelope.recipient_email.clone());
            if self.rejects.contains(&envelope.recipient_email) {
                SendOutcome::rejected(self.reason.clone(), FailureClass::Permanent)
            } else {
                SendOutcome::Delivered
            }
        }
    }

    /// Board that keeps every publication in order.
    #[derive(Default)]
    struct RecordingBoard {
        history: std::sync::Mutex<Vec<RunProgress>>,
    }

    #[async_trait]
    impl ProgressBoard for RecordingBoard {
        async fn register(&self, _run_id: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn publish(&self, _run_id: &str, progress: RunProgress) -> Result<(), StoreError> {
            self.history.lock().unwrap().push(progress);
            Ok(())
        }

        async fn read(&self, _run_id: &str) -> Result<Option<RunProgress>, StoreError> {
            Ok(self.history.lock().unwrap().last().cloned())
        }
    }

    /// Store whose writes fail for one recipient.
    struct FlakyStore {
        inner: SqliteStore,
        broken: std::sync::Mutex<Option<RecipientId>>,
    }

    #[async_trait]
    impl CampaignStore for FlakyStore {
        async fn create_campaign(
            &self,
            campaign: NewCampaign,
            recipients: Vec<String>,
        ) -> Result<Campaign, StoreError> {
            self.inner.create_campaign(campaign, recipients).await
        }

        async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
            self.inner.campaign(id).await
        }

        async fn begin_sending(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
            self.inner.begin_sending(id).await
        }

        async fn pending_recipients(&self, id: CampaignId) -> Result<Vec<Recipient>, StoreError> {
            self.inner.pending_recipients(id).await
        }

        async fn recipients(&self, id: CampaignId) -> Result<Vec<Recipient>, StoreError> {
            self.inner.recipients(id).await
        }

        async fn resolve_recipient(
            &self,
            campaign_id: CampaignId,
            recipient_id: RecipientId,
            resolution: &Resolution,
        ) -> Result<ResolveOutcome, StoreError> {
            if *self.broken.lock().unwrap() == Some(recipient_id) {
                return Err(StoreError::Database("disk I/O error".to_string()));
            }
            self.inner
                .resolve_recipient(campaign_id, recipient_id, resolution)
                .await
        }

        async fn mark_completed(&self, id: CampaignId) -> Result<(), StoreError> {
            self.inner.mark_completed(id).await
        }

        async fn mark_failed(&self, id: CampaignId) -> Result<(), StoreError> {
            self.inner.mark_failed(id).await
        }
    }

    fn new_campaign() -> NewCampaign {
        NewCampaign {
            sender_email: "news@example.com".to_string(),
            sender_name: None,
            subject: "Hello".to_string(),
            content: "Hi there".to_string(),
            is_html: false,
        }
    }

    fn addresses(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("user{}@example.com", i)).collect()
    }

    fn fast_settings() -> DispatchSettings {
        DispatchSettings {
            batch_size: 50,
            batch_delay: Duration::ZERO,
            concurrency: 1,
        }
    }

    struct Harness {
        store: Arc<SqliteStore>,
        transport: Arc<FakeTransport>,
        board: Arc<RecordingBoard>,
        dispatcher: Dispatcher,
    }

    async fn harness(transport: FakeTransport, settings: DispatchSettings) -> Harness {
        let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let transport = Arc::new(transport);
        let board = Arc::new(RecordingBoard::default());
        let dispatcher = Dispatcher::new(
            store.clone(),
            transport.clone(),
            board.clone(),
            settings,
        );
        Harness {
            store,
            transport,
            board,
            dispatcher,
        }
    }

    #[tokio::test]
    async fn test_run_sends_every_pending_recipient() {
        let h = harness(FakeTransport::default(), fast_settings()).await;
        let campaign = h.store.create_campaign(new_campaign(), addresses(3)).await.unwrap();

        let summary = h.dispatcher.run("run-1", campaign.id).await.unwrap();

        assert_eq!(
            summary,
            RunSummary {
                total: 3,
                sent: 3,
                failed: 0,
                skipped: 0
            }
        );
        assert_eq!(h.transport.attempts(), addresses(3));

        let stored = h.store.campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Completed);
        assert_eq!(stored.emails_sent, 3);
        let recipients = h.store.recipients(campaign.id).await.unwrap();
        assert!(recipients.iter().all(|r| r.status == RecipientStatus::Sent));
    }

    #[tokio::test]
    async fn test_progress_snapshots_in_order() {
        let h = harness(
            FakeTransport::rejecting(&["user1@example.com"], "relay denied"),
            fast_settings(),
        )
        .await;
        let campaign = h.store.create_campaign(new_campaign(), addresses(3)).await.unwrap();

        h.dispatcher.run("run-1", campaign.id).await.unwrap();

        let history = h.board.history.lock().unwrap().clone();
        assert_eq!(
            history,
            vec![
                RunProgress::InProgress(ProgressSnapshot::step(1, 3, 1, 0)),
                RunProgress::InProgress(ProgressSnapshot::step(2, 3, 1, 1)),
                RunProgress::InProgress(ProgressSnapshot::step(3, 3, 2, 1)),
                RunProgress::Success(ProgressSnapshot::completed(3, 2, 1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_long_failure_reason_is_truncated() {
        let reason = format!("mailbox full {}", "x".repeat(400));
        let h = harness(
            FakeTransport::rejecting(&["x@y.com"], &reason),
            fast_settings(),
        )
        .await;
        let campaign = h
            .store
            .create_campaign(new_campaign(), vec!["x@y.com".to_string()])
            .await
            .unwrap();

        let summary = h.dispatcher.run("run-1", campaign.id).await.unwrap();
        assert_eq!(summary.failed, 1);

        let recipient = h.store.recipients(campaign.id).await.unwrap().remove(0);
        assert_eq!(recipient.status, RecipientStatus::Failed);
        let stored_reason = recipient.error_message.unwrap();
        assert_eq!(stored_reason.chars().count(), ERROR_MESSAGE_MAX_LEN);
        assert!(stored_reason.starts_with("mailbox full"));

        let stored = h.store.campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.emails_failed, 1);
        // Recipient failures alone never fail the campaign.
        assert_eq!(stored.status, CampaignStatus::Completed);
    }

    #[tokio::test]
    async fn test_batch_pauses_for_120_recipients() {
        let h = harness(FakeTransport::default(), fast_settings()).await;
        let limiter = Arc::new(BatchLimiter::new(50, Duration::ZERO));
        let dispatcher = Dispatcher::new(
            h.store.clone(),
            h.transport.clone(),
            h.board.clone(),
            fast_settings(),
        )
        .with_limiter(limiter.clone());
        let campaign = h.store.create_campaign(new_campaign(), addresses(120)).await.unwrap();

        let summary = dispatcher.run("run-1", campaign.id).await.unwrap();

        assert_eq!(summary.sent, 120);
        // After recipients 50 and 100, not after 120.
        assert_eq!(limiter.pauses(), 2);
    }

    #[tokio::test]
    async fn test_rerun_with_nothing_pending_is_noop() {
        let h = harness(FakeTransport::default(), fast_settings()).await;
        let campaign = h.store.create_campaign(new_campaign(), addresses(2)).await.unwrap();

        h.dispatcher.run("run-1", campaign.id).await.unwrap();
        let summary = h.dispatcher.run("run-2", campaign.id).await.unwrap();

        assert_eq!(summary.total, 0);
        assert_eq!(summary.sent, 2);
        assert_eq!(h.transport.attempts().len(), 2);

        let stored = h.store.campaign(campaign.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CampaignStatus::Completed);
        assert_eq!(stored.emails_sent + stored.emails_failed, 2);
    }

    #[tokio::test]
    async fn test_resumed_run_only_touches_pending() {
        let h = harness(FakeTransport::default(), fast_settings()).await;
        let campaign = h.store.create_campaign(new_campaign(), addresses(4)).await.unwrap();

        // Simulate a previous run that stopped after two recipients.
        h.store.begin_sending(campaign.id).await.unwrap();
        let pending = h.store.pending_recipients(campaign.id).await.unwrap();
        for recipient in &pending[..2] {
            h.store
                .resolve_recipient(campaign.id, recipient.id, &Resolution::Sent)
                .await
                .unwrap();
        }

        let summary = h.dispatcher.run("run-2", campaign.id).await.unwrap();

        assert_eq!(summary.total, 2);
        assert_eq!(summary.sent, 4);
        assert_eq!(
            h.transport.attempts(),
            vec!["user2@example.com".to_string(), "user3@example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_missing_campaign_fails_run() {
        let h = harness(FakeTransport::default(), fast_settings()).await;

        let err = h.dispatcher.run("run-1", 99).await.unwrap_err();

        assert!(matches!(err, DispatchError::CampaignNotFound(99)));
        assert_eq!(
            h.board.read("run-1").await.unwrap(),
            Some(RunProgress::Failure(CAMPAIGN_NOT_FOUND.to_string()))
        );
        assert!(h.transport.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_failed_campaign_is_not_dispatched() {
        let h = harness(FakeTransport::default(), fast_settings()).await;
        let campaign = h.store.create_campaign(new_campaign(), addresses(1)).await.unwrap();
        h.store.mark_failed(campaign.id).await.unwrap();

        let err = h.dispatcher.run("run-1", campaign.id).await.unwrap_err();

        assert!(matches!(err, DispatchError::CampaignFailed(_)));
        assert!(h.transport.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_unexpected_recipient_error_does_not_abort_run() {
        let inner = SqliteStore::open_in_memory().await.unwrap();
        let campaign = inner.create_campaign(new_campaign(), addresses(3)).await.unwrap();
        let broken = inner.pending_recipients(campaign.id).await.unwrap()[1].id;
        let store = Arc::new(FlakyStore {
            inner,
            broken: std::sync::Mutex::new(Some(broken)),
        });
        let transport = Arc::new(FakeTransport::default());
        let board = Arc::new(MemoryProgress::new());
        let dispatcher = Dispatcher::new(store.clone(), transport.clone(), board.clone(), fast_settings());

        let summary = dispatcher.run("run-1", campaign.id).await.unwrap();

        assert_eq!(summary.sent, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(transport.attempts().len(), 3);

        let recipients = store.recipients(campaign.id).await.unwrap();
        assert_eq!(recipients[1].status, RecipientStatus::Pending);
        assert_eq!(recipients[2].status, RecipientStatus::Sent);

        let progress = board.read("run-1").await.unwrap().unwrap();
        assert_eq!(progress.state(), RunState::Success);

        // Once the store recovers, a new run picks the skipped recipient up.
        *store.broken.lock().unwrap() = None;
        let retry = dispatcher.run("run-2", campaign.id).await.unwrap();
        assert_eq!(retry.total, 1);
        assert_eq!(retry.sent, 3);
    }

    #[tokio::test]
    async fn test_concurrent_run_resolves_each_recipient_once() {
        let settings = DispatchSettings {
            batch_size: 10,
            batch_delay: Duration::ZERO,
            concurrency: 4,
        };
        let h = harness(
            FakeTransport::rejecting(&["user3@example.com", "user7@example.com"], "rejected"),
            settings,
        )
        .await;
        let campaign = h.store.create_campaign(new_campaign(), addresses(25)).await.unwrap();

        let summary = h.dispatcher.run("run-1", campaign.id).await.unwrap();

        assert_eq!(summary.sent, 23);
        assert_eq!(summary.failed, 2);
        assert_eq!(h.transport.attempts().len(), 25);

        let stored = h.store.campaign(campaign.id).await.unwrap().unwrap();
        assert!(stored.emails_sent + stored.emails_failed <= stored.total_recipients);

        let history = h.board.history.lock().unwrap().clone();
        let currents: Vec<u64> = history
            .iter()
            .filter_map(|p| p.snapshot().map(|s| s.current))
            .collect();
        assert!(currents.windows(2).all(|w| w[0] <= w[1]));
    }
}
