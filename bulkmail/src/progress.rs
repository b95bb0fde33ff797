//! Progress publication for dispatch runs.
//!
//! The dispatcher writes the latest snapshot of a run here and pollers read it
//! back by run id. Only the last write is kept. The surface is separate from
//! the campaign tables: losing it on restart is acceptable, losing campaign
//! rows is not.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::store::StoreError;

/// Identity of one dispatch run.
pub type RunId = String;

/// Status message of the final snapshot of a successful run.
pub const COMPLETED_MESSAGE: &str = "Completed";

/// Readout of a run's position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Recipients processed so far in this run
    pub current: u64,
    /// Pending recipients at the start of this run
    pub total: u64,
    /// Campaign-wide sent counter
    pub sent: u64,
    /// Campaign-wide failed counter
    pub failed: u64,
    /// Human-readable status line
    pub status: String,
}

impl ProgressSnapshot {
    /// Snapshot published after the `current`-th recipient of a run.
    pub fn step(current: u64, total: u64, sent: u64, failed: u64) -> Self {
        Self {
            current,
            total,
            sent,
            failed,
            status: format!("Sent {} of {}", current, total),
        }
    }

    /// Final snapshot of a run.
    pub fn completed(total: u64, sent: u64, failed: u64) -> Self {
        Self {
            current: total,
            total,
            sent,
            failed,
            status: COMPLETED_MESSAGE.to_string(),
        }
    }
}

/// Coarse state of a run, as reported to pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunState {
    Pending,
    Progress,
    Success,
    Failure,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::Progress => "PROGRESS",
            RunState::Success => "SUCCESS",
            RunState::Failure => "FAILURE",
        }
    }
}

/// Latest known progress of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunProgress {
    /// Registered but nothing published yet
    Pending,
    InProgress(ProgressSnapshot),
    Success(ProgressSnapshot),
    /// Run aborted; carries the reason
    Failure(String),
}

impl RunProgress {
    pub fn state(&self) -> RunState {
        match self {
            RunProgress::Pending => RunState::Pending,
            RunProgress::InProgress(_) => RunState::Progress,
            RunProgress::Success(_) => RunState::Success,
            RunProgress::Failure(_) => RunState::Failure,
        }
    }

    pub fn snapshot(&self) -> Option<&ProgressSnapshot> {
        match self {
            RunProgress::InProgress(s) | RunProgress::Success(s) => Some(s),
            _ => None,
        }
    }
}

/// Key-value surface holding the latest progress of each run.
#[async_trait]
pub trait ProgressBoard: Send + Sync {
    /// Make a run known so reads report it as pending rather than missing.
    async fn register(&self, run_id: &str) -> Result<(), StoreError>;

    /// Replace the run's progress.
    async fn publish(&self, run_id: &str, progress: RunProgress) -> Result<(), StoreError>;

    /// Latest progress, or `None` for a run id that was never registered.
    async fn read(&self, run_id: &str) -> Result<Option<RunProgress>, StoreError>;
}

/// In-process progress board.
#[derive(Default)]
pub struct MemoryProgress {
    runs: RwLock<HashMap<RunId, RunProgress>>,
}

impl MemoryProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressBoard for MemoryProgress {
    async fn register(&self, run_id: &str) -> Result<(), StoreError> {
        self.runs
            .write()
            .await
            .entry(run_id.to_string())
            .or_insert(RunProgress::Pending);
        Ok(())
    }

    async fn publish(&self, run_id: &str, progress: RunProgress) -> Result<(), StoreError> {
        self.runs.write().await.insert(run_id.to_string(), progress);
        Ok(())
    }

    async fn read(&self, run_id: &str) -> Result<Option<RunProgress>, StoreError> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }
}
