//! Per-stage progress record persisted with each job.
//!
//! `current_task` names the stage that should run next; each stage keeps its
//! own status, attempt count and timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccountId;

/// Pipeline stage a job is at.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Generate,
    Poll,
    Download,
    /// Every stage has committed.
    Completed,
}

/// Status of a single stage.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// An earlier stage has not finished.
    Blocked,
    Pending,
    Running,
    /// Deferred: waiting on an account or a not-ready render.
    Waiting,
    Completed,
    Failed,
}

/// Bookkeeping shared by every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub status: StageStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    fn with_status(status: StageStatus) -> Self {
        Self {
            status,
            attempts: 0,
            last_error: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Record the start of an attempt.
    pub fn begin(&mut self, now: DateTime<Utc>) {
        self.status = StageStatus::Running;
        self.attempts += 1;
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    pub fn wait(&mut self, note: Option<String>) {
        self.status = StageStatus::Waiting;
        if note.is_some() {
            self.last_error = note;
        }
    }

    pub fn complete(&mut self, now: DateTime<Utc>) {
        self.status = StageStatus::Completed;
        self.completed_at = Some(now);
        self.last_error = None;
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = StageStatus::Failed;
        self.last_error = Some(error.into());
    }

    /// Record a retryable error and mark the stage pending again.
    pub fn retry(&mut self, error: impl Into<String>) {
        self.status = StageStatus::Pending;
        self.last_error = Some(error.into());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateStage {
    #[serde(flatten)]
    pub record: StageRecord,
    #[serde(default)]
    pub account_id: Option<AccountId>,
    /// Accounts that failed this job during the current rotation.
    #[serde(default)]
    pub excluded_accounts: Vec<AccountId>,
    #[serde(default)]
    pub credits_before: Option<i64>,
    #[serde(default)]
    pub credits_after: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollStage {
    #[serde(flatten)]
    pub record: StageRecord,
    #[serde(default)]
    pub polls: u32,
    #[serde(default)]
    pub last_progress: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStage {
    #[serde(flatten)]
    pub record: StageRecord,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// Structured task state of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskState {
    pub current_task: Stage,
    pub generate: GenerateStage,
    pub poll: PollStage,
    pub download: DownloadStage,
}

impl Default for TaskState {
    fn default() -> Self {
        Self {
            current_task: Stage::Generate,
            generate: GenerateStage {
                record: StageRecord::with_status(StageStatus::Pending),
                account_id: None,
                excluded_accounts: Vec::new(),
                credits_before: None,
                credits_after: None,
            },
            poll: PollStage {
                record: StageRecord::with_status(StageStatus::Blocked),
                polls: 0,
                last_progress: None,
            },
            download: DownloadStage {
                record: StageRecord::with_status(StageStatus::Blocked),
                file_size: None,
            },
        }
    }
}

impl TaskState {
    /// Record for `stage`, or `None` for [`Stage::Completed`].
    pub fn record(&self, stage: Stage) -> Option<&StageRecord> {
        match stage {
            Stage::Generate => Some(&self.generate.record),
            Stage::Poll => Some(&self.poll.record),
            Stage::Download => Some(&self.download.record),
            Stage::Completed => None,
        }
    }

    pub fn record_mut(&mut self, stage: Stage) -> Option<&mut StageRecord> {
        match stage {
            Stage::Generate => Some(&mut self.generate.record),
            Stage::Poll => Some(&mut self.poll.record),
            Stage::Download => Some(&mut self.download.record),
            Stage::Completed => None,
        }
    }

    /// Complete `stage` and unblock the one after it.
    pub fn advance(&mut self, stage: Stage, now: DateTime<Utc>) {
        if let Some(record) = self.record_mut(stage) {
            record.complete(now);
        }
        let next = match stage {
            Stage::Generate => Stage::Poll,
            Stage::Poll => Stage::Download,
            Stage::Download | Stage::Completed => Stage::Completed,
        };
        if let Some(record) = self.record_mut(next) {
            record.status = StageStatus::Pending;
        }
        self.current_task = next;
    }

    /// Status of the current stage, `Completed` once every stage has committed.
    pub fn current_status(&self) -> StageStatus {
        self.record(self.current_task)
            .map(|r| r.status)
            .unwrap_or(StageStatus::Completed)
    }
}
