//! SQLite-backed store.
//!
//! All statements run on tokio-rusqlite's single background connection
//! thread, so writes within one process are serialized. The web server and the
//! worker open the same database file; WAL mode and a busy timeout let them
//! share it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;
use tracing::info;

use super::{CampaignStore, ResolveOutcome, StoreError};
use crate::model::{
    Campaign, CampaignCounters, CampaignId, NewCampaign, Recipient, RecipientId, Resolution,
};
use crate::progress::{ProgressBoard, ProgressSnapshot, RunProgress};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS campaigns (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sender_email TEXT NOT NULL,
    sender_name TEXT,
    subject TEXT NOT NULL,
    content TEXT NOT NULL,
    is_html INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    total_recipients INTEGER NOT NULL,
    emails_sent INTEGER NOT NULL DEFAULT 0,
    emails_failed INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS recipients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    campaign_id INTEGER NOT NULL REFERENCES campaigns(id),
    email TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_recipients_campaign_status
    ON recipients (campaign_id, status);

CREATE TABLE IF NOT EXISTS dispatch_runs (
    run_id TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    current INTEGER NOT NULL DEFAULT 0,
    total INTEGER NOT NULL DEFAULT 0,
    sent INTEGER NOT NULL DEFAULT 0,
    failed INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT '',
    updated_at TEXT NOT NULL
);
";

const CAMPAIGN_COLUMNS: &str = "id, sender_email, sender_name, subject, content, is_html, \
     created_at, status, total_recipients, emails_sent, emails_failed";

const RECIPIENT_COLUMNS: &str = "id, campaign_id, email, status, error_message";

/// SQLite implementation of [`CampaignStore`] and [`ProgressBoard`].
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database file at `path`.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).await.map_err(db_err)?;
        let store = Self::init(conn).await?;
        info!(path = %path, "store_opened");
        Ok(store)
    }

    /// Open a private in-memory database.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().await.map_err(db_err)?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| -> rusqlite::Result<()> {
            conn.busy_timeout(Duration::from_secs(5))?;
            conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
            conn.pragma_update(None, "foreign_keys", true)?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(db_err)?;

        Ok(Self {
            conn: Arc::new(conn),
        })
    }

    /// Close the background connection.
    pub async fn close(self) -> Result<(), StoreError> {
        match Arc::try_unwrap(self.conn) {
            Ok(conn) => conn.close().await.map_err(db_err),
            // Other clones still hold the connection; it closes with the last one.
            Err(_) => Ok(()),
        }
    }
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

fn bad_text(idx: usize, e: crate::model::UnknownStatus) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

fn campaign_from_row(row: &Row<'_>) -> rusqlite::Result<Campaign> {
    let status: String = row.get(7)?;
    Ok(Campaign {
        id: row.get(0)?,
        sender_email: row.get(1)?,
        sender_name: row.get(2)?,
        subject: row.get(3)?,
        content: row.get(4)?,
        is_html: row.get(5)?,
        created_at: row.get(6)?,
        status: status.parse().map_err(|e| bad_text(7, e))?,
        total_recipients: row.get::<_, i64>(8)? as u64,
        emails_sent: row.get::<_, i64>(9)? as u64,
        emails_failed: row.get::<_, i64>(10)? as u64,
    })
}

fn recipient_from_row(row: &Row<'_>) -> rusqlite::Result<Recipient> {
    let status: String = row.get(3)?;
    Ok(Recipient {
        id: row.get(0)?,
        campaign_id: row.get(1)?,
        email: row.get(2)?,
        status: status.parse().map_err(|e| bad_text(3, e))?,
        error_message: row.get(4)?,
    })
}

fn load_campaign(conn: &rusqlite::Connection, id: CampaignId) -> rusqlite::Result<Option<Campaign>> {
    conn.query_row(
        &format!("SELECT {CAMPAIGN_COLUMNS} FROM campaigns WHERE id = ?1"),
        params![id],
        campaign_from_row,
    )
    .optional()
}

fn load_recipients(
    conn: &rusqlite::Connection,
    id: CampaignId,
    pending_only: bool,
) -> rusqlite::Result<Vec<Recipient>> {
    let filter = if pending_only {
        " AND status = 'pending'"
    } else {
        ""
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT {RECIPIENT_COLUMNS} FROM recipients WHERE campaign_id = ?1{filter} ORDER BY id ASC"
    ))?;
    let rows = stmt
        .query_map(params![id], recipient_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[async_trait]
impl CampaignStore for SqliteStore {
    async fn create_campaign(
        &self,
        campaign: NewCampaign,
        recipients: Vec<String>,
    ) -> Result<Campaign, StoreError> {
        let created_at = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> rusqlite::Result<Campaign> {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO campaigns (sender_email, sender_name, subject, content, is_html, \
                     created_at, status, total_recipients) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'pending', ?7)",
                    params![
                        campaign.sender_email,
                        campaign.sender_name,
                        campaign.subject,
                        campaign.content,
                        campaign.is_html,
                        created_at,
                        recipients.len() as i64,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                {
                    let mut stmt =
                        tx.prepare("INSERT INTO recipients (campaign_id, email) VALUES (?1, ?2)")?;
                    for email in &recipients {
                        stmt.execute(params![id, email])?;
                    }
                }
                let created = load_campaign(&tx, id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                tx.commit()?;
                Ok(created)
            })
            .await
            .map_err(db_err)
    }

    async fn campaign(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        self.conn
            .call(move |conn| -> rusqlite::Result<Option<Campaign>> { load_campaign(conn, id) })
            .await
            .map_err(db_err)
    }

    async fn begin_sending(&self, id: CampaignId) -> Result<Option<Campaign>, StoreError> {
        self.conn
            .call(move |conn| -> rusqlite::Result<Option<Campaign>> {
                let tx = conn.transaction()?;
                tx.execute(
                    "UPDATE campaigns SET status = 'sending' WHERE id = ?1 AND status = 'pending'",
                    params![id],
                )?;
                let campaign = load_campaign(&tx, id)?;
                tx.commit()?;
                Ok(campaign)
            })
            .await
            .map_err(db_err)
    }

    async fn pending_recipients(&self, id: CampaignId) -> Result<Vec<Recipient>, StoreError> {
        self.conn
            .call(move |conn| -> rusqlite::Result<Vec<Recipient>> {
                load_recipients(conn, id, true)
            })
            .await
            .map_err(db_err)
    }

    async fn recipients(&self, id: CampaignId) -> Result<Vec<Recipient>, StoreError> {
        self.conn
            .call(move |conn| -> rusqlite::Result<Vec<Recipient>> {
                load_recipients(conn, id, false)
            })
            .await
            .map_err(db_err)
    }

    async fn resolve_recipient(
        &self,
        campaign_id: CampaignId,
        recipient_id: RecipientId,
        resolution: &Resolution,
    ) -> Result<ResolveOutcome, StoreError> {
        let resolution = resolution.clone();
        self.conn
            .call(move |conn| -> rusqlite::Result<ResolveOutcome> {
                let tx = conn.transaction()?;
                let error_message = match &resolution {
                    Resolution::Sent => None,
                    Resolution::Failed { reason } => Some(reason.clone()),
                };
                let changed = tx.execute(
                    "UPDATE recipients SET status = ?1, error_message = ?2 \
                     WHERE id = ?3 AND campaign_id = ?4 AND status = 'pending'",
                    params![
                        resolution.status().as_str(),
                        error_message,
                        recipient_id,
                        campaign_id
                    ],
                )?;

                let applied = changed == 1;
                if applied {
                    let counter = match resolution {
                        Resolution::Sent => "emails_sent = emails_sent + 1",
                        Resolution::Failed { .. } => "emails_failed = emails_failed + 1",
                    };
                    tx.execute(
                        &format!(
                            "UPDATE campaigns SET {counter} WHERE id = ?1 \
                             AND emails_sent + emails_failed < total_recipients"
                        ),
                        params![campaign_id],
                    )?;
                }

                let (sent, failed): (i64, i64) = tx.query_row(
                    "SELECT emails_sent, emails_failed FROM campaigns WHERE id = ?1",
                    params![campaign_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )?;
                tx.commit()?;

                Ok(ResolveOutcome {
                    applied,
                    counters: CampaignCounters {
                        sent: sent as u64,
                        failed: failed as u64,
                    },
                })
            })
            .await
            .map_err(db_err)
    }

    async fn mark_completed(&self, id: CampaignId) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| -> rusqlite::Result<()> {
                conn.execute(
                    "UPDATE campaigns SET status = 'completed' WHERE id = ?1 AND status != 'failed'",
                    params![id],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    async fn mark_failed(&self, id: CampaignId) -> Result<(), StoreError> {
        self.conn
            .call(move |conn| -> rusqlite::Result<()> {
                conn.execute(
                    "UPDATE campaigns SET status = 'failed' WHERE id = ?1 AND status != 'completed'",
                    params![id],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }
}

/// Raw `dispatch_runs` row: state, counters, status line.
type RunRow = (String, i64, i64, i64, i64, String);

fn progress_from_row(row: RunRow) -> Result<RunProgress, StoreError> {
    let (state, current, total, sent, failed, status) = row;
    let snapshot = || ProgressSnapshot {
        current: current as u64,
        total: total as u64,
        sent: sent as u64,
        failed: failed as u64,
        status: status.clone(),
    };
    match state.as_str() {
        "PENDING" => Ok(RunProgress::Pending),
        "PROGRESS" => Ok(RunProgress::InProgress(snapshot())),
        "SUCCESS" => Ok(RunProgress::Success(snapshot())),
        "FAILURE" => Ok(RunProgress::Failure(status.clone())),
        other => Err(StoreError::Corrupt(format!("run state {other}"))),
    }
}

#[async_trait]
impl ProgressBoard for SqliteStore {
    async fn register(&self, run_id: &str) -> Result<(), StoreError> {
        let run_id = run_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> rusqlite::Result<()> {
                conn.execute(
                    "INSERT OR IGNORE INTO dispatch_runs (run_id, state, updated_at) \
                     VALUES (?1, 'PENDING', ?2)",
                    params![run_id, now],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    async fn publish(&self, run_id: &str, progress: RunProgress) -> Result<(), StoreError> {
        let run_id = run_id.to_string();
        let now = Utc::now().to_rfc3339();
        let state = progress.state().as_str();
        let (current, total, sent, failed, status) = match &progress {
            RunProgress::Pending => (0, 0, 0, 0, String::new()),
            RunProgress::InProgress(s) | RunProgress::Success(s) => (
                s.current as i64,
                s.total as i64,
                s.sent as i64,
                s.failed as i64,
                s.status.clone(),
            ),
            RunProgress::Failure(reason) => (0, 0, 0, 0, reason.clone()),
        };
        self.conn
            .call(move |conn| -> rusqlite::Result<()> {
                conn.execute(
                    "INSERT INTO dispatch_runs \
                     (run_id, state, current, total, sent, failed, status, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(run_id) DO UPDATE SET \
                     state = excluded.state, current = excluded.current, \
                     total = excluded.total, sent = excluded.sent, \
                     failed = excluded.failed, status = excluded.status, \
                     updated_at = excluded.updated_at",
                    params![run_id, state, current, total, sent, failed, status, now],
                )?;
                Ok(())
            })
            .await
            .map_err(db_err)
    }

    async fn read(&self, run_id: &str) -> Result<Option<RunProgress>, StoreError> {
        let run_id = run_id.to_string();
        let row = self
            .conn
            .call(move |conn| -> rusqlite::Result<Option<RunRow>> {
                conn.query_row(
                    "SELECT state, current, total, sent, failed, status \
                     FROM dispatch_runs WHERE run_id = ?1",
                    params![run_id],
                    |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    },
                )
                .optional()
            })
            .await
            .map_err(db_err)?;

        row.map(progress_from_row).transpose()
    }
}
