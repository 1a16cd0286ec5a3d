//! sqlx implementation of [`JobStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};

use super::DbPool;
use super::models::{AccountRow, JobRow};
use super::retry::retry_on_sqlite_busy;
use super::time::{from_ms, to_ms, truncate_ms};
use crate::domain::{Account, AccountId, Job, JobId, JobStatus, NewAccount, NewJob};
use crate::store::JobStore;
use crate::{Error, Result};

const JOB_COLUMNS_SET: &str = r#"
    platform = ?, prompt = ?, duration_secs = ?, aspect_ratio = ?, image_ref = ?,
    status = ?, progress = ?, error_message = ?, error_kind = ?,
    retry_count = ?, max_retries = ?,
    provider_task_id = ?, video_id = ?, download_url = ?, local_path = ?,
    account_id = ?, task_state = ?,
    updated_at = MAX(?, updated_at + 1)
"#;

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: DbPool,
}

impl SqliteJobStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn job_exists(&self, id: JobId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Run the shared UPDATE for `job`, optionally guarded on `updated_at`.
    ///
    /// Returns the new `updated_at` in epoch milliseconds, or `None` when no
    /// row matched.
    async fn update_job(&self, job: &Job, expected_ms: Option<i64>) -> Result<Option<i64>> {
        let row = JobRow::from_job(job)?;
        let now = to_ms(Utc::now());
        let guard = if expected_ms.is_some() {
            " AND updated_at = ?"
        } else {
            ""
        };
        let sql = format!("UPDATE jobs SET {JOB_COLUMNS_SET} WHERE id = ?{guard} RETURNING updated_at");

        retry_on_sqlite_busy("update_job", || async {
            let mut query = sqlx::query_scalar::<_, i64>(&sql)
                .bind(&row.platform)
                .bind(&row.prompt)
                .bind(row.duration_secs)
                .bind(&row.aspect_ratio)
                .bind(&row.image_ref)
                .bind(&row.status)
                .bind(row.progress)
                .bind(&row.error_message)
                .bind(&row.error_kind)
                .bind(row.retry_count)
                .bind(row.max_retries)
                .bind(&row.provider_task_id)
                .bind(&row.video_id)
                .bind(&row.download_url)
                .bind(&row.local_path)
                .bind(row.account_id)
                .bind(&row.task_state)
                .bind(now)
                .bind(row.id);
            if let Some(expected) = expected_ms {
                query = query.bind(expected);
            }
            Ok(query.fetch_optional(&self.pool).await?)
        })
        .await
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_job(&self, job: NewJob, max_retries: u32) -> Result<Job> {
        job.spec.validate()?;
        let draft = Job::draft(JobId(0), job.spec, max_retries, truncate_ms(Utc::now()));
        let row = JobRow::from_job(&draft)?;

        let id = retry_on_sqlite_busy("insert_job", || async {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO jobs (
                    platform, prompt, duration_secs, aspect_ratio, image_ref,
                    status, progress, retry_count, max_retries, task_state,
                    created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(&row.platform)
            .bind(&row.prompt)
            .bind(row.duration_secs)
            .bind(&row.aspect_ratio)
            .bind(&row.image_ref)
            .bind(&row.status)
            .bind(row.progress)
            .bind(row.retry_count)
            .bind(row.max_retries)
            .bind(&row.task_state)
            .bind(row.created_at)
            .bind(row.updated_at)
            .fetch_one(&self.pool)
            .await?;
            Ok(id)
        })
        .await?;

        Ok(Job {
            id: JobId(id),
            ..draft
        })
    }

    async fn load_job(&self, id: JobId) -> Result<Job> {
        sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Job", id))?
            .into_job()
    }

    async fn save_job(&self, job: &Job) -> Result<Job> {
        let updated_at = self
            .update_job(job, None)
            .await?
            .ok_or_else(|| Error::not_found("Job", job.id))?;
        Ok(Job {
            updated_at: from_ms(updated_at),
            ..job.clone()
        })
    }

    async fn save_job_if_unchanged(
        &self,
        job: &Job,
        expected: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        if let Some(updated_at) = self.update_job(job, Some(to_ms(expected))).await? {
            return Ok(Some(Job {
                updated_at: from_ms(updated_at),
                ..job.clone()
            }));
        }
        if self.job_exists(job.id).await? {
            Ok(None)
        } else {
            Err(Error::not_found("Job", job.id))
        }
    }

    async fn list_jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM jobs WHERE status IN (");
        let mut separated = qb.separated(", ");
        for status in statuses {
            separated.push_bind(status.as_str());
        }
        separated.push_unseparated(") ORDER BY id");

        qb.build_query_as::<JobRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(JobRow::into_job)
            .collect()
    }

    async fn insert_account(&self, account: NewAccount) -> Result<Account> {
        let draft = Account::from_new(AccountId(0), account, truncate_ms(Utc::now()));
        let row = AccountRow::from_account(&draft);

        let id = retry_on_sqlite_busy("insert_account", || async {
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO accounts (
                    platform, label, auth_ref, token_status, credits, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(&row.platform)
            .bind(&row.label)
            .bind(&row.auth_ref)
            .bind(&row.token_status)
            .bind(row.credits)
            .bind(row.created_at)
            .bind(row.updated_at)
            .fetch_one(&self.pool)
            .await?;
            Ok(id)
        })
        .await?;

        Ok(Account {
            id: AccountId(id),
            ..draft
        })
    }

    async fn load_account(&self, id: AccountId) -> Result<Account> {
        sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found("Account", id))?
            .into_account()
    }

    async fn save_account(&self, account: &Account) -> Result<()> {
        let row = AccountRow::from_account(account);
        let now = to_ms(Utc::now());

        let affected = retry_on_sqlite_busy("save_account", || async {
            let result = sqlx::query(
                r#"
                UPDATE accounts SET
                    platform = ?, label = ?, auth_ref = ?, token_status = ?,
                    credits = ?, credits_reset_at = ?, last_used = ?,
                    lease_holder = ?, lease_acquired_at = ?, lease_expires_at = ?,
                    updated_at = MAX(?, updated_at + 1)
                WHERE id = ?
                "#,
            )
            .bind(&row.platform)
            .bind(&row.label)
            .bind(&row.auth_ref)
            .bind(&row.token_status)
            .bind(row.credits)
            .bind(row.credits_reset_at)
            .bind(row.last_used)
            .bind(row.lease_holder)
            .bind(row.lease_acquired_at)
            .bind(row.lease_expires_at)
            .bind(now)
            .bind(row.id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if affected == 0 {
            return Err(Error::not_found("Account", account.id));
        }
        Ok(())
    }

    async fn list_accounts(&self, platform: Option<&str>) -> Result<Vec<Account>> {
        let rows = match platform {
            Some(platform) => {
                sqlx::query_as::<_, AccountRow>(
                    "SELECT * FROM accounts WHERE platform = ? ORDER BY id",
                )
                .bind(platform)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, AccountRow>("SELECT * FROM accounts ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(AccountRow::into_account).collect()
    }

    async fn list_available_accounts(
        &self,
        platform: &str,
        exclude: &[AccountId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Account>> {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM accounts WHERE platform = ");
        qb.push_bind(platform);
        qb.push(" AND (credits IS NULL OR credits > 0)");
        qb.push(" AND (lease_holder IS NULL OR lease_expires_at IS NULL OR lease_expires_at <= ");
        qb.push_bind(to_ms(now));
        qb.push(")");
        if !exclude.is_empty() {
            qb.push(" AND id NOT IN (");
            let mut separated = qb.separated(", ");
            for id in exclude {
                separated.push_bind(id.0);
            }
            separated.push_unseparated(")");
        }
        // Never-used accounts first, then least recently used.
        qb.push(" ORDER BY last_used IS NOT NULL, last_used ASC, id ASC");

        qb.build_query_as::<AccountRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(AccountRow::into_account)
            .collect()
    }
}
