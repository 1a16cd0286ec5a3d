use sqlx::FromRow;

use crate::database::time::{from_ms, to_ms};
use crate::domain::{
    AccountId, AspectRatio, ErrorKind, Job, JobId, JobResult, JobSpec, JobStatus, TaskState,
};
use crate::{Error, Result};

/// Row of the `jobs` table.
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: i64,
    pub platform: String,
    pub prompt: String,
    pub duration_secs: i64,
    pub aspect_ratio: String,
    pub image_ref: Option<String>,
    pub status: String,
    pub progress: i64,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub provider_task_id: Option<String>,
    pub video_id: Option<String>,
    pub download_url: Option<String>,
    pub local_path: Option<String>,
    pub account_id: Option<i64>,
    /// JSON-encoded [`TaskState`].
    pub task_state: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobRow {
    pub fn from_job(job: &Job) -> Result<Self> {
        Ok(Self {
            id: job.id.0,
            platform: job.spec.platform.clone(),
            prompt: job.spec.prompt.clone(),
            duration_secs: i64::from(job.spec.duration_secs),
            aspect_ratio: job.spec.aspect_ratio.to_string(),
            image_ref: job.spec.image_ref.clone(),
            status: job.status.as_str().to_string(),
            progress: i64::from(job.progress),
            error_message: job.error_message.clone(),
            error_kind: job.error_kind.map(|k| k.to_string()),
            retry_count: i64::from(job.retry_count),
            max_retries: i64::from(job.max_retries),
            provider_task_id: job.result.provider_task_id.clone(),
            video_id: job.result.video_id.clone(),
            download_url: job.result.download_url.clone(),
            local_path: job.result.local_path.clone(),
            account_id: job.account_id.map(|a| a.0),
            task_state: serde_json::to_string(&job.task_state)?,
            created_at: to_ms(job.created_at),
            updated_at: to_ms(job.updated_at),
        })
    }

    pub fn into_job(self) -> Result<Job> {
        let status = JobStatus::parse(&self.status).ok_or_else(|| {
            Error::Other(format!("job {} has unknown status '{}'", self.id, self.status))
        })?;
        let aspect_ratio: AspectRatio = self.aspect_ratio.parse().map_err(|_| {
            Error::Other(format!(
                "job {} has unknown aspect ratio '{}'",
                self.id, self.aspect_ratio
            ))
        })?;
        let error_kind = match self.error_kind.as_deref() {
            Some(raw) => Some(raw.parse::<ErrorKind>().map_err(|_| {
                Error::Other(format!("job {} has unknown error kind '{}'", self.id, raw))
            })?),
            None => None,
        };
        let task_state: TaskState = serde_json::from_str(&self.task_state)?;

        Ok(Job {
            id: JobId(self.id),
            spec: JobSpec {
                platform: self.platform,
                prompt: self.prompt,
                duration_secs: u32::try_from(self.duration_secs).unwrap_or_default(),
                aspect_ratio,
                image_ref: self.image_ref,
            },
            status,
            progress: u8::try_from(self.progress.clamp(0, 100)).unwrap_or(100),
            error_message: self.error_message,
            error_kind,
            retry_count: u32::try_from(self.retry_count).unwrap_or_default(),
            max_retries: u32::try_from(self.max_retries).unwrap_or_default(),
            result: JobResult {
                provider_task_id: self.provider_task_id,
                video_id: self.video_id,
                download_url: self.download_url,
                local_path: self.local_path,
            },
            account_id: self.account_id.map(AccountId),
            task_state,
            created_at: from_ms(self.created_at),
            updated_at: from_ms(self.updated_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::time::truncate_ms;
    use chrono::Utc;

    #[test]
    fn test_row_conversion_preserves_job() {
        let now = truncate_ms(Utc::now());
        let mut job = Job::draft(
            JobId(12),
            JobSpec::new("sora", "lighthouse at dusk", 15, AspectRatio::Portrait)
                .with_image_ref("uploads/ref.png"),
            3,
            now,
        );
        job.status = JobStatus::Generating;
        job.error_kind = Some(ErrorKind::ProviderTransient);
        job.account_id = Some(AccountId(2));
        job.result.provider_task_id = Some("task_abc".to_string());

        let row = JobRow::from_job(&job).unwrap();
        assert_eq!(row.status, "generating");
        assert_eq!(row.aspect_ratio, "9:16");
        assert_eq!(row.error_kind.as_deref(), Some("provider_transient"));

        assert_eq!(row.into_job().unwrap(), job);
    }

    #[test]
    fn test_unknown_status_is_an_error() {
        let job = Job::draft(
            JobId(1),
            JobSpec::new("sora", "x", 5, AspectRatio::Square),
            3,
            Utc::now(),
        );
        let mut row = JobRow::from_job(&job).unwrap();
        row.status = "exploded".to_string();
        assert!(row.into_job().is_err());
    }
}
