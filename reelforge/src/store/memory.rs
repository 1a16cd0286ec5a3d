//! In-process store over `DashMap`.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::{JobStore, next_stamp};
use crate::domain::{Account, AccountId, Job, JobId, JobStatus, NewAccount, NewJob};
use crate::{Error, Result};

/// Store that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: DashMap<JobId, Job>,
    accounts: DashMap<AccountId, Account>,
    next_job_id: AtomicI64,
    next_account_id: AtomicI64,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert_job(&self, job: NewJob, max_retries: u32) -> Result<Job> {
        job.spec.validate()?;
        let id = JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst) + 1);
        let job = Job::draft(id, job.spec, max_retries, Utc::now());
        self.jobs.insert(id, job.clone());
        Ok(job)
    }

    async fn load_job(&self, id: JobId) -> Result<Job> {
        self.jobs
            .get(&id)
            .map(|j| j.clone())
            .ok_or_else(|| Error::not_found("Job", id))
    }

    async fn save_job(&self, job: &Job) -> Result<Job> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(mut entry) => {
                let mut stored = job.clone();
                stored.updated_at = next_stamp(entry.get().updated_at);
                entry.insert(stored.clone());
                Ok(stored)
            }
            Entry::Vacant(_) => Err(Error::not_found("Job", job.id)),
        }
    }

    async fn save_job_if_unchanged(
        &self,
        job: &Job,
        expected: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(mut entry) => {
                if entry.get().updated_at != expected {
                    return Ok(None);
                }
                let mut stored = job.clone();
                stored.updated_at = next_stamp(expected);
                entry.insert(stored.clone());
                Ok(Some(stored))
            }
            Entry::Vacant(_) => Err(Error::not_found("Job", job.id)),
        }
    }

    async fn list_jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = self
            .jobs
            .iter()
            .filter(|j| statuses.contains(&j.status))
            .map(|j| j.clone())
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn insert_account(&self, account: NewAccount) -> Result<Account> {
        let id = AccountId(self.next_account_id.fetch_add(1, Ordering::SeqCst) + 1);
        let account = Account::from_new(id, account, Utc::now());
        self.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn load_account(&self, id: AccountId) -> Result<Account> {
        self.accounts
            .get(&id)
            .map(|a| a.clone())
            .ok_or_else(|| Error::not_found("Account", id))
    }

    async fn save_account(&self, account: &Account) -> Result<()> {
        match self.accounts.get_mut(&account.id) {
            Some(mut stored) => {
                let mut updated = account.clone();
                updated.updated_at = next_stamp(stored.updated_at);
                *stored = updated;
                Ok(())
            }
            None => Err(Error::not_found("Account", account.id)),
        }
    }

    async fn list_accounts(&self, platform: Option<&str>) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .filter(|a| platform.is_none_or(|p| a.platform == p))
            .map(|a| a.clone())
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn list_available_accounts(
        &self,
        platform: &str,
        exclude: &[AccountId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .filter(|a| a.is_available_for(platform, exclude, now))
            .map(|a| a.clone())
            .collect();
        // `None < Some(_)`, so never-used accounts sort first.
        accounts.sort_by_key(|a| (a.last_used, a.id));
        Ok(accounts)
    }
}
