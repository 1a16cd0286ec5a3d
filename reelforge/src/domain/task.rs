//! Ephemeral units of queued work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task_state::Stage;
use super::{AccountId, Job, JobId};

/// Which queue a task belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Generate,
    Poll,
    Download,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [Self::Generate, Self::Poll, Self::Download];

    pub fn stage(&self) -> Stage {
        match self {
            Self::Generate => Stage::Generate,
            Self::Poll => Stage::Poll,
            Self::Download => Stage::Download,
        }
    }
}

/// Stage-specific input carried by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskPayload {
    Generate {
        excluded_accounts: Vec<AccountId>,
    },
    Poll {
        account_id: AccountId,
        provider_task_id: String,
    },
    Download {
        account_id: AccountId,
        video_id: Option<String>,
        download_url: String,
    },
}

/// One queued stage of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub job_id: JobId,
    pub payload: TaskPayload,
    /// Times this task has been re-enqueued for the same stage.
    pub attempt: u32,
    /// Claim token; the task is void once the job's claim moves on.
    pub epoch: u64,
    pub enqueued_at: DateTime<Utc>,
}

impl Task {
    fn new(job_id: JobId, epoch: u64, payload: TaskPayload) -> Self {
        Self {
            job_id,
            payload,
            attempt: 0,
            epoch,
            enqueued_at: Utc::now(),
        }
    }

    pub fn generate(job_id: JobId, epoch: u64, excluded_accounts: Vec<AccountId>) -> Self {
        Self::new(job_id, epoch, TaskPayload::Generate { excluded_accounts })
    }

    pub fn poll(
        job_id: JobId,
        epoch: u64,
        account_id: AccountId,
        provider_task_id: impl Into<String>,
    ) -> Self {
        Self::new(
            job_id,
            epoch,
            TaskPayload::Poll {
                account_id,
                provider_task_id: provider_task_id.into(),
            },
        )
    }

    pub fn download(
        job_id: JobId,
        epoch: u64,
        account_id: AccountId,
        video_id: Option<String>,
        download_url: impl Into<String>,
    ) -> Self {
        Self::new(
            job_id,
            epoch,
            TaskPayload::Download {
                account_id,
                video_id,
                download_url: download_url.into(),
            },
        )
    }

    /// Rebuild the task for `stage` from what the job record holds.
    ///
    /// Falls back to the previous stage when the inputs for `stage` were
    /// never persisted.
    pub fn for_stage(job: &Job, stage: Stage, epoch: u64) -> Self {
        let account_id = job.account_id;
        let result = &job.result;
        match stage {
            Stage::Download | Stage::Completed => {
                if let (Some(account_id), Some(url)) = (account_id, result.download_url.as_ref())
                {
                    return Self::download(
                        job.id,
                        epoch,
                        account_id,
                        result.video_id.clone(),
                        url.clone(),
                    );
                }
                Self::for_stage(job, Stage::Poll, epoch)
            }
            Stage::Poll => {
                if let (Some(account_id), Some(task_id)) =
                    (account_id, result.provider_task_id.as_ref())
                {
                    return Self::poll(job.id, epoch, account_id, task_id.clone());
                }
                Self::for_stage(job, Stage::Generate, epoch)
            }
            Stage::Generate => Self::generate(
                job.id,
                epoch,
                job.task_state.generate.excluded_accounts.clone(),
            ),
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self.payload {
            TaskPayload::Generate { .. } => TaskKind::Generate,
            TaskPayload::Poll { .. } => TaskKind::Poll,
            TaskPayload::Download { .. } => TaskKind::Download,
        }
    }

    /// Same stage, one attempt later.
    pub fn next_attempt(mut self) -> Self {
        self.attempt += 1;
        self.enqueued_at = Utc::now();
        self
    }
}
