//! Domain types for the orchestration core.
//!
//! Jobs, accounts, the per-stage task state record and the ephemeral tasks
//! carried by the queues.

pub mod account;
pub mod job;
pub mod task;
pub mod task_state;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use account::{Account, AccountLease, NewAccount, TokenStatus};
pub use job::{AspectRatio, ErrorKind, Job, JobResult, JobSpec, JobStatus, NewJob};
pub use task::{Task, TaskKind, TaskPayload};
pub use task_state::{Stage, StageRecord, StageStatus, TaskState};

/// Identifier of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

/// Identifier of an account record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for AccountId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}
