//! Stage workers.
//!
//! Each queue is drained by a [`StagePool`] that runs its tasks through a
//! [`StageHandler`]. Handlers never hold a job record across a provider call:
//! they reload it and commit through [`commit`], which re-checks the task's
//! claim and writes with a compare-and-swap on `updated_at`.

pub mod backoff;
pub mod download;
pub mod generate;
pub mod poll;
pub mod pool;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::domain::{ErrorKind, Job, Stage, Task, TaskKind, TaskPayload};
use crate::orchestrator::OrchestratorContext;
use crate::Result;

pub use download::DownloadHandler;
pub use generate::GenerateHandler;
pub use poll::PollHandler;
pub use pool::StagePool;

/// Attempts at a compare-and-swap commit before giving up on the task.
const COMMIT_ATTEMPTS: u32 = 5;

#[async_trait]
pub trait StageHandler: Send + Sync {
    fn kind(&self) -> TaskKind;

    /// Run one task. An `Err` is an internal failure; provider failures are
    /// handled inside and recorded on the job.
    async fn handle(&self, ctx: &Arc<OrchestratorContext>, task: Task) -> Result<()>;
}

/// Handler for each stage queue.
pub fn handler_for(kind: TaskKind) -> Arc<dyn StageHandler> {
    match kind {
        TaskKind::Generate => Arc::new(GenerateHandler),
        TaskKind::Poll => Arc::new(PollHandler),
        TaskKind::Download => Arc::new(DownloadHandler),
    }
}

/// Load the job `task` works on.
///
/// Returns `None` (and drops the claim where appropriate) when the task was
/// superseded or the job is no longer active.
pub(crate) async fn load_for_task(ctx: &OrchestratorContext, task: &Task) -> Result<Option<Job>> {
    if !ctx.queues.is_current(task) {
        debug!(job_id = %task.job_id, epoch = task.epoch, "Dropping superseded task");
        return Ok(None);
    }

    let job = match ctx.store.load_job(task.job_id).await {
        Ok(job) => job,
        Err(e) if e.is_not_found() => {
            warn!(job_id = %task.job_id, "Job vanished while queued");
            ctx.queues.release(task.job_id, task.epoch);
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    if !job.status.is_active() {
        debug!(job_id = %job.id, status = %job.status, "Job no longer active, dropping task");
        ctx.queues.release(job.id, task.epoch);
        return Ok(None);
    }
    Ok(Some(job))
}

/// Apply `mutate` to the current job record and save it.
///
/// The save only lands if nothing else wrote the job since it was loaded;
/// on a conflict the job is reloaded and `mutate` runs again. Returns `None`
/// when the task lost its claim or the job left the active set, in which
/// case nothing is written.
pub(crate) async fn commit<F>(
    ctx: &OrchestratorContext,
    task: &Task,
    mut mutate: F,
) -> Result<Option<Job>>
where
    F: FnMut(&mut Job) -> Result<()> + Send,
{
    for _ in 0..COMMIT_ATTEMPTS {
        let Some(mut job) = load_for_task(ctx, task).await? else {
            return Ok(None);
        };
        let expected = job.updated_at;
        mutate(&mut job)?;
        if let Some(saved) = ctx.store.save_job_if_unchanged(&job, expected).await? {
            return Ok(Some(saved));
        }
        debug!(job_id = %task.job_id, "Job changed during commit, reloading");
    }
    Err(crate::Error::Other(format!(
        "job {} kept changing during commit",
        task.job_id
    )))
}

/// Drop the claim of a job that reached a terminal state.
pub(crate) fn finish(ctx: &OrchestratorContext, task: &Task, job: &Job) {
    ctx.queues.release(task.job_id, task.epoch);
    info!(
        job_id = %job.id,
        status = %job.status,
        retries = job.retry_count,
        "Job finished"
    );
}

/// Fail the job without retrying.
pub(crate) async fn fail_job(
    ctx: &OrchestratorContext,
    task: &Task,
    kind: ErrorKind,
    message: impl Into<String>,
) -> Result<()> {
    let message = message.into();
    let stage = task.kind().stage();
    let failed = commit(ctx, task, |job| {
        if let Some(record) = job.task_state.record_mut(stage) {
            record.fail(message.clone());
        }
        job.fail(kind, message.clone())
    })
    .await?;

    if let Some(job) = failed {
        warn!(job_id = %job.id, kind = %kind, error = %message, "Job failed");
        finish(ctx, task, &job);
    }
    Ok(())
}

/// Consume one retry for `task`'s stage, then requeue `next` after a backoff
/// or fail the job once the budget is spent.
pub(crate) async fn retry_or_fail(
    ctx: &OrchestratorContext,
    task: &Task,
    next: Task,
    kind: ErrorKind,
    message: impl Into<String>,
) -> Result<()> {
    let message = message.into();
    let stage = task.kind().stage();
    let excluded = match &next.payload {
        TaskPayload::Generate { excluded_accounts } => Some(excluded_accounts.clone()),
        _ => None,
    };

    let updated = commit(ctx, task, |job| {
        job.retry_count += 1;
        if let Some(excluded) = &excluded {
            job.task_state.generate.excluded_accounts = excluded.clone();
        }
        if job.retry_count < job.max_retries {
            if let Some(record) = job.task_state.record_mut(stage) {
                record.retry(message.clone());
            }
            Ok(())
        } else {
            if let Some(record) = job.task_state.record_mut(stage) {
                record.fail(message.clone());
            }
            job.fail(kind, message.clone())
        }
    })
    .await?;

    let Some(job) = updated else {
        return Ok(());
    };
    if job.status.is_terminal() {
        warn!(
            job_id = %job.id,
            kind = %kind,
            retries = job.retry_count,
            error = %message,
            "Retry budget exhausted"
        );
        finish(ctx, task, &job);
        return Ok(());
    }

    let delay = backoff::retry_delay(
        ctx.config.generate_retry_delay,
        job.retry_count,
        ctx.config.max_backoff,
    );
    info!(
        job_id = %job.id,
        stage = %stage,
        retry = job.retry_count,
        max_retries = job.max_retries,
        ?delay,
        error = %message,
        "Retrying stage"
    );
    ctx.queues.submit_after(next, delay);
    Ok(())
}

/// Record an internal failure raised while handling `task`.
///
/// The job is failed with kind `internal` if the store still accepts writes;
/// otherwise it is left for stale recovery.
pub(crate) async fn fail_internal(ctx: &OrchestratorContext, task: &Task, err: &crate::Error) {
    error!(
        job_id = %task.job_id,
        stage = %task.kind(),
        error = %err,
        "Internal error while handling task"
    );

    if let Err(e) = ctx.accounts.release_holder(task.job_id).await {
        warn!(job_id = %task.job_id, error = %e, "Failed to release account lease");
    }
    if let Err(e) = fail_job(ctx, task, ErrorKind::Internal, err.to_string()).await {
        warn!(
            job_id = %task.job_id,
            error = %e,
            "Could not record internal failure, leaving job for stale recovery"
        );
    }
}

/// Bump `updated_at` on a job whose stage is waiting but alive.
pub(crate) fn touch_stage(job: &mut Job, stage: Stage, note: Option<String>) {
    if let Some(record) = job.task_state.record_mut(stage) {
        record.wait(note);
    }
}
