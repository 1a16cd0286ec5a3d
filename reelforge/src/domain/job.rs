//! Job record and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task_state::TaskState;
use super::{AccountId, JobId};
use crate::{Error, Result};

/// Durations (seconds) accepted by the providers.
pub const SUPPORTED_DURATIONS: [u32; 3] = [5, 10, 15];

/// Job status values.
#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum JobStatus {
    /// Created, not yet started.
    Draft,
    /// Waiting for a worker to pick up its current stage.
    Pending,
    /// A worker is running the generate stage.
    Processing,
    /// The prompt has been handed to the provider.
    SentPrompt,
    /// The provider is rendering; poll tasks track readiness.
    Generating,
    /// The artifact is being fetched.
    Download,
    /// Finished by a result path that reports completion separately; same as `Done`.
    Completed,
    /// Artifact stored locally.
    Done,
    /// Gave up, see `error_message`.
    Failed,
    /// Stopped by an operator.
    Cancelled,
}

impl JobStatus {
    /// Statuses a job can hold while work is outstanding.
    pub const ACTIVE: [JobStatus; 5] = [
        Self::Pending,
        Self::Processing,
        Self::SentPrompt,
        Self::Generating,
        Self::Download,
    ];

    /// Statuses that mean a worker was (or is) running a stage.
    pub const PROCESSING_LIKE: [JobStatus; 4] = [
        Self::Processing,
        Self::SentPrompt,
        Self::Generating,
        Self::Download,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::SentPrompt => "sent_prompt",
            Self::Generating => "generating",
            Self::Download => "download",
            Self::Completed => "completed",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn is_active(&self) -> bool {
        Self::ACTIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done | Self::Completed | Self::Failed | Self::Cancelled
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Done | Self::Completed)
    }

    /// Statuses reachable from `self` in one step.
    ///
    /// `failed -> pending` and `cancelled -> pending` exist only for retry;
    /// `<processing-like> -> pending` only for stale recovery and reset.
    pub fn allowed_transitions(&self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Draft => &[Pending],
            Pending => &[Processing, Failed, Cancelled],
            Processing => &[
                SentPrompt, Generating, Download, Completed, Done, Pending, Failed, Cancelled,
            ],
            SentPrompt => &[Generating, Pending, Failed, Cancelled],
            Generating => &[Download, Pending, Failed, Cancelled],
            Download => &[Done, Completed, Pending, Failed, Cancelled],
            Completed => &[Done],
            Done => &[],
            Failed => &[Pending],
            Cancelled => &[Pending],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }
}

/// Machine-readable failure category stored next to `error_message`.
#[derive(
    Debug,
    Clone,
    Copy,
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
pub enum ErrorKind {
    AccountUnavailable,
    ProviderTransient,
    ProviderPermanent,
    VerificationFailure,
    StaleJob,
    InvalidTransition,
    SystemPaused,
    Internal,
}

impl ErrorKind {
    /// Whether a failure of this kind is charged against the retry budget.
    pub fn consumes_retry(&self) -> bool {
        matches!(
            self,
            Self::ProviderTransient | Self::VerificationFailure | Self::StaleJob
        )
    }
}

/// Output shape requested from the provider.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum AspectRatio {
    #[strum(serialize = "16:9")]
    #[serde(rename = "16:9")]
    Landscape,
    #[strum(serialize = "9:16")]
    #[serde(rename = "9:16")]
    Portrait,
    #[strum(serialize = "1:1")]
    #[serde(rename = "1:1")]
    Square,
}

impl AspectRatio {
    pub fn orientation(&self) -> &'static str {
        match self {
            Self::Landscape => "landscape",
            Self::Portrait => "portrait",
            Self::Square => "square",
        }
    }
}

/// Immutable description of what a job should produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Platform whose accounts and provider run this job.
    pub platform: String,
    pub prompt: String,
    pub duration_secs: u32,
    pub aspect_ratio: AspectRatio,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}

impl JobSpec {
    pub fn new(
        platform: impl Into<String>,
        prompt: impl Into<String>,
        duration_secs: u32,
        aspect_ratio: AspectRatio,
    ) -> Self {
        Self {
            platform: platform.into(),
            prompt: prompt.into(),
            duration_secs,
            aspect_ratio,
            image_ref: None,
        }
    }

    pub fn with_image_ref(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.platform.trim().is_empty() {
            return Err(Error::validation("platform must not be empty"));
        }
        if self.prompt.trim().is_empty() {
            return Err(Error::validation("prompt must not be empty"));
        }
        if !SUPPORTED_DURATIONS.contains(&self.duration_secs) {
            return Err(Error::validation(format!(
                "duration must be one of {:?} seconds, got {}",
                SUPPORTED_DURATIONS, self.duration_secs
            )));
        }
        Ok(())
    }

    /// Frame count at 30 fps.
    pub fn n_frames(&self) -> u32 {
        self.duration_secs * 30
    }
}

/// Outputs collected while the job moves through its stages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub provider_task_id: Option<String>,
    pub video_id: Option<String>,
    pub download_url: Option<String>,
    pub local_path: Option<String>,
}

/// Input for creating a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub spec: JobSpec,
    /// Falls back to the configured default when `None`.
    pub max_retries: Option<u32>,
}

impl NewJob {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// A video generation job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobSpec,
    pub status: JobStatus,
    /// 0..=100.
    pub progress: u8,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub result: JobResult,
    pub account_id: Option<AccountId>,
    pub task_state: TaskState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Build a draft job. The store assigns the real id on insert.
    pub fn draft(id: JobId, spec: JobSpec, max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id,
            spec,
            status: JobStatus::Draft,
            progress: 0,
            error_message: None,
            error_kind: None,
            retry_count: 0,
            max_retries,
            result: JobResult::default(),
            account_id: None,
            task_state: TaskState::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting edges outside the transition table.
    ///
    /// On error the job is left unchanged.
    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    /// Bring a resumed job into the status a worker stage runs under.
    ///
    /// A `pending` job passes through `processing` first. Returns whether the
    /// status changed.
    pub fn resume_into(&mut self, target: JobStatus) -> Result<bool> {
        if self.status == target {
            return Ok(false);
        }
        if self.status == JobStatus::Pending && target != JobStatus::Processing {
            self.transition(JobStatus::Processing)?;
            if self.status == target {
                return Ok(true);
            }
        }
        self.transition(target)?;
        Ok(true)
    }

    /// Mark the job failed with a human-readable message and machine kind.
    pub fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error_kind = Some(kind);
        self.error_message = Some(message.into());
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<()> {
        if !self.status.is_active() {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: JobStatus::Cancelled,
            });
        }
        self.transition(JobStatus::Cancelled)?;
        self.error_kind = None;
        self.error_message = Some(reason.into());
        Ok(())
    }

    /// Reset a failed or cancelled job so it can be started again.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        if !matches!(self.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: JobStatus::Pending,
            });
        }
        self.transition(JobStatus::Pending)?;
        self.progress = 0;
        self.error_message = None;
        self.error_kind = None;
        self.retry_count = 0;
        self.result = JobResult::default();
        self.account_id = None;
        self.task_state = TaskState::default();
        Ok(())
    }

    pub fn set_progress(&mut self, progress: u8) {
        self.progress = progress.min(100);
    }

    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn can_start(&self) -> bool {
        matches!(self.status, JobStatus::Draft | JobStatus::Pending)
    }
}
