//! Generate stage: lease an account and submit the prompt.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use super::{StageHandler, commit, fail_job, retry_or_fail, touch_stage};
use crate::Result;
use crate::accounts::Allocation;
use crate::domain::{
    Account, AccountId, ErrorKind, JobStatus, Stage, Task, TaskKind, TaskPayload, TokenStatus,
};
use crate::orchestrator::OrchestratorContext;
use crate::provider::{GenerationRequest, GenerationTicket, ProviderError, VideoProvider};

/// Progress once the provider accepted the prompt.
pub const PROGRESS_SUBMITTED: u8 = 30;
/// Progress when a job starts processing.
pub const PROGRESS_STARTED: u8 = 10;

pub struct GenerateHandler;

#[async_trait]
impl StageHandler for GenerateHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::Generate
    }

    async fn handle(&self, ctx: &Arc<OrchestratorContext>, task: Task) -> Result<()> {
        let excluded_accounts = match &task.payload {
            TaskPayload::Generate { excluded_accounts } => excluded_accounts.clone(),
            _ => {
                return Err(crate::Error::validation(
                    "generate queue received a non-generate task",
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

        let Some(Allocation {
            account,
            rotation_reset,
        }) = ctx
            .accounts
            .acquire(&job.spec.platform, &excluded_accounts, job.id)
            .await?
        else {
            return wait_for_account(ctx, task).await;
        };
        let mut excluded = if rotation_reset {
            Vec::new()
        } else {
            excluded_accounts
        };

        let outcome = run_with_account(ctx, &task, provider.as_ref(), &account).await;

        // Held through login, submission and the credit refresh.
        if let Err(e) = ctx.accounts.release(account.id, job.id).await {
            warn!(account_id = %account.id, job_id = %job.id, error = %e, "Failed to release account");
        }

        match outcome? {
            Attempt::Discarded => Ok(()),
            Attempt::LoginFailed(err) => {
                excluded.push(account.id);
                relogin_elsewhere(ctx, task, excluded, err).await
            }
            Attempt::Accepted {
                ticket,
                credits_after,
            } => accepted(ctx, &task, account.id, ticket, credits_after).await,
            Attempt::Rejected(err) if err.is_transient() => {
                excluded.push(account.id);
                let next = Task::generate(task.job_id, task.epoch, excluded).next_attempt();
                retry_or_fail(ctx, &task, next, ErrorKind::ProviderTransient, err.to_string())
                    .await
            }
            Attempt::Rejected(err) => {
                fail_job(ctx, &task, ErrorKind::ProviderPermanent, err.to_string()).await
            }
        }
    }
}

enum Attempt {
    /// The job left the active set or the task lost its claim.
    Discarded,
    LoginFailed(ProviderError),
    Accepted {
        ticket: GenerationTicket,
        credits_after: Option<i64>,
    },
    Rejected(ProviderError),
}

async fn run_with_account(
    ctx: &OrchestratorContext,
    task: &Task,
    provider: &dyn VideoProvider,
    account: &Account,
) -> Result<Attempt> {
    let account_id = account.id;
    let credits_before = account.credits;
    let started = commit(ctx, task, |job| {
        job.resume_into(JobStatus::Processing)?;
        job.set_progress(PROGRESS_STARTED.max(job.progress));
        job.account_id = Some(account_id);
        let generate = &mut job.task_state.generate;
        generate.record.begin(Utc::now());
        generate.account_id = Some(account_id);
        generate.credits_before = credits_before;
        Ok(())
    })
    .await?;
    let Some(job) = started else {
        return Ok(Attempt::Discarded);
    };

    if account.needs_login() {
        debug!(account_id = %account.id, "Logging in");
        match provider.login(account).await {
            Ok(()) => {
                ctx.accounts
                    .set_token_status(account.id, TokenStatus::Valid)
                    .await?;
            }
            Err(e) => {
                ctx.accounts
                    .set_token_status(account.id, TokenStatus::Expired)
                    .await?;
                return Ok(Attempt::LoginFailed(e));
            }
        }
    }

    info!(job_id = %job.id, account_id = %account.id, "Submitting generation request");
    let request = GenerationRequest::from(&job.spec);
    let ticket = match provider.generate_video(account, &request).await {
        Ok(ticket) => ticket,
        Err(e) => return Ok(Attempt::Rejected(e)),
    };
    let credits_after = refresh_credits(ctx, provider, account).await?;
    Ok(Attempt::Accepted {
        ticket,
        credits_after,
    })
}

/// Read the balance left after a submission and store it on the account.
async fn refresh_credits(
    ctx: &OrchestratorContext,
    provider: &dyn VideoProvider,
    account: &Account,
) -> Result<Option<i64>> {
    match provider.get_credits(account).await {
        Ok(credits) => {
            let updated = ctx
                .accounts
                .record_credits(account.id, credits, Utc::now())
                .await?;
            Ok(updated.credits)
        }
        Err(e) => {
            debug!(account_id = %account.id, error = %e, "Credit refresh failed");
            Ok(None)
        }
    }
}

/// No account right now: requeue without touching the retry budget.
async fn wait_for_account(ctx: &OrchestratorContext, task: Task) -> Result<()> {
    let waiting = commit(ctx, &task, |job| {
        touch_stage(
            job,
            Stage::Generate,
            Some("waiting for an available account".to_string()),
        );
        Ok(())
    })
    .await?;
    if waiting.is_some() {
        debug!(job_id = %task.job_id, "No account available, requeueing");
        ctx.queues
            .submit_after(task.next_attempt(), ctx.config.generate_retry_delay);
    }
    Ok(())
}

/// Login failed: mark the account, try another one without charging a retry.
async fn relogin_elsewhere(
    ctx: &OrchestratorContext,
    task: Task,
    excluded: Vec<AccountId>,
    err: ProviderError,
) -> Result<()> {
    warn!(job_id = %task.job_id, error = %err, "Account login failed");
    let message = format!("login failed: {}", err.message());
    let recorded = commit(ctx, &task, |job| {
        job.task_state.generate.excluded_accounts = excluded.clone();
        job.task_state.generate.record.retry(message.clone());
        Ok(())
    })
    .await?;
    if recorded.is_some() {
        let next = Task::generate(task.job_id, task.epoch, excluded).next_attempt();
        ctx.queues.submit_after(next, ctx.config.generate_retry_delay);
    }
    Ok(())
}

async fn accepted(
    ctx: &OrchestratorContext,
    task: &Task,
    account_id: AccountId,
    ticket: GenerationTicket,
    credits_after: Option<i64>,
) -> Result<()> {
    let task_id = ticket.task_id.clone();
    let committed = commit(ctx, task, |job| {
        job.result.provider_task_id = Some(task_id.clone());
        job.account_id = Some(account_id);
        job.task_state.generate.credits_after = credits_after;
        job.task_state.generate.excluded_accounts.clear();
        job.task_state.advance(Stage::Generate, Utc::now());
        job.transition(JobStatus::Generating)?;
        job.set_progress(PROGRESS_SUBMITTED);
        Ok(())
    })
    .await?;

    let Some(job) = committed else {
        info!(
            job_id = %task.job_id,
            provider_task_id = %ticket.task_id,
            "Job left the pipeline during generation, dropping result"
        );
        return Ok(());
    };

    info!(
        job_id = %job.id,
        provider_task_id = %ticket.task_id,
        "Generation accepted"
    );
    let next = Task::poll(job.id, task.epoch, account_id, ticket.task_id);
    ctx.queues.submit_after(next, ctx.config.poll_delay);
    Ok(())
}
