//! Poll stage: wait for the provider to finish rendering.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use super::{StageHandler, commit, fail_job, retry_or_fail, touch_stage};
use crate::Result;
use crate::domain::{ErrorKind, Job, JobStatus, Stage, Task, TaskKind, TaskPayload};
use crate::orchestrator::OrchestratorContext;
use crate::provider::PollStatus;

/// Progress once the render is ready for download.
pub const PROGRESS_READY: u8 = 90;

/// Map a provider percentage into the poll stage's share of job progress.
pub fn scaled_progress(provider_pct: u8) -> u8 {
    let span = u16::from(PROGRESS_READY - super::generate::PROGRESS_SUBMITTED);
    let scaled = u16::from(provider_pct.min(100)) * span / 100;
    super::generate::PROGRESS_SUBMITTED + scaled as u8
}

pub struct PollHandler;

#[async_trait]
impl StageHandler for PollHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Poll
    }

    async fn handle(&self, ctx: &Arc<OrchestratorContext>, task: Task) -> Result<()> {
        let (account_id, provider_task_id) = match &task.payload {
            TaskPayload::Poll {
                account_id,
                provider_task_id,
            } => (*account_id, provider_task_id.clone()),
            _ => {
                return Err(crate::Error::validation(
                    "poll queue received a non-poll task",
                ));
            }
        };
        let Some(job) = super::load_for_task(ctx, &task).await? else {
            return Ok(());
        };

        let provider = match ctx.providers.get(&job.spec.platform) {
            Ok(provider) => provider,
            Err(_) => {
                let msg = format!("no provider registered for platform '{}'", job.spec.platform);
                return fail_job(ctx, &task, ErrorKind::ProviderPermanent, msg).await;
            }
        };
        let account = ctx.store.load_account(account_id).await?;

        debug!(job_id = %job.id, provider_task_id = %provider_task_id, "Polling render status");
        match provider.poll_status(&account, &provider_task_id).await {
            Ok(PollStatus::Ready {
                video_id,
                download_url,
            }) => {
                let committed = commit(ctx, &task, |job| {
                    enter_poll(job)?;
                    job.result.video_id = Some(video_id.clone());
                    job.result.download_url = Some(download_url.clone());
                    job.task_state.poll.last_progress = Some(100);
                    job.task_state.advance(Stage::Poll, Utc::now());
                    job.transition(JobStatus::Download)?;
                    job.set_progress(PROGRESS_READY);
                    Ok(())
                })
                .await?;
                let Some(job) = committed else {
                    return Ok(());
                };

                info!(job_id = %job.id, video_id = %video_id, "Render ready");
                let next = Task::download(job.id, task.epoch, account_id, Some(video_id), download_url);
                ctx.queues.submit(next).await
            }
            Ok(PollStatus::NotReady { progress_pct }) => {
                let committed = commit(ctx, &task, |job| {
                    enter_poll(job)?;
                    touch_stage(job, Stage::Poll, None);
                    job.task_state.poll.polls += 1;
                    if let Some(pct) = progress_pct {
                        job.task_state.poll.last_progress = Some(pct.min(100));
                        job.set_progress(scaled_progress(pct).max(job.progress));
                    }
                    Ok(())
                })
                .await?;
                if committed.is_some() {
                    ctx.queues
                        .submit_after(task.next_attempt(), ctx.config.poll_delay);
                }
                Ok(())
            }
            Err(e) if e.is_transient() => {
                let next = task.clone().next_attempt();
                retry_or_fail(ctx, &task, next, ErrorKind::ProviderTransient, e.to_string()).await
            }
            Err(e) => fail_job(ctx, &task, ErrorKind::ProviderPermanent, e.to_string()).await,
        }
    }
}

/// Bring a job resumed at the poll stage into `generating` and mark the stage
/// running.
fn enter_poll(job: &mut Job) -> Result<()> {
    job.resume_into(JobStatus::Generating)?;
    let record = &mut job.task_state.poll.record;
    if record.started_at.is_none() {
        record.begin(Utc::now());
    }
    Ok(())
}
