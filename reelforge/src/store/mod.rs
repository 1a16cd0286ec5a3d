//! Persistence gateway for job and account records.
//!
//! Workers, the account pool and the stale monitor only touch records through
//! [`JobStore`]. Two implementations are provided: [`MemoryJobStore`] and the
//! sqlx-backed [`crate::database::SqliteJobStore`].

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::Result;
use crate::domain::{Account, AccountId, Job, JobId, JobStatus, NewAccount, NewJob};

pub use memory::MemoryJobStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a validated job in `draft` status.
    async fn insert_job(&self, job: NewJob, max_retries: u32) -> Result<Job>;

    async fn load_job(&self, id: JobId) -> Result<Job>;

    /// Persist `job` and return the stored copy with its new `updated_at`.
    ///
    /// `updated_at` strictly increases on every save of the same job.
    async fn save_job(&self, job: &Job) -> Result<Job>;

    /// Persist `job` only if the stored `updated_at` still equals `expected`.
    ///
    /// Returns `None` when the record changed in the meantime.
    async fn save_job_if_unchanged(
        &self,
        job: &Job,
        expected: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    async fn list_jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>>;

    async fn insert_account(&self, account: NewAccount) -> Result<Account>;

    async fn load_account(&self, id: AccountId) -> Result<Account>;

    async fn save_account(&self, account: &Account) -> Result<()>;

    async fn list_accounts(&self, platform: Option<&str>) -> Result<Vec<Account>>;

    /// Accounts satisfying the availability predicate at `now`, least recently
    /// used first (never-used accounts lead).
    async fn list_available_accounts(
        &self,
        platform: &str,
        exclude: &[AccountId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>>;
}

/// Next `updated_at` for a record last stamped at `previous`.
pub(crate) fn next_stamp(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::milliseconds(1)
    }
}
