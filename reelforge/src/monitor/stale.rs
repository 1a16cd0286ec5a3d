//! Stale job monitor.
//!
//! A job is stale when it is active, its `updated_at` is older than the
//! configured cutoff, and its current task is not waiting in a queue. The
//! clock stops while the pipeline is paused and restarts on resume. Each
//! recovery is a compare-and-swap on `updated_at`, so a worker that commits
//! first wins and the monitor leaves the job alone.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Result;
use crate::domain::{ErrorKind, Job, JobStatus, Stage, Task, TaskKind};
use crate::orchestrator::OrchestratorContext;
use crate::queue::QueueDepthStatus;

/// Failure message for jobs whose retry budget ran out while stale.
pub const STALE_REASON: &str = "stale: no progress";

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed: usize,
    /// Stale candidates that changed before they could be recovered.
    pub skipped: usize,
    pub accounts_restored: usize,
    pub leases_reaped: usize,
}

enum Recovery {
    Requeued,
    Failed,
    Skipped,
}

pub struct StaleJobMonitor {
    ctx: Arc<OrchestratorContext>,
}

impl StaleJobMonitor {
    pub fn new(ctx: Arc<OrchestratorContext>) -> Self {
        Self { ctx }
    }

    /// Sweep every `stale_check_interval` until `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.ctx.config.stale_check_interval;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; start recovering one period in.
            ticker.tick().await;
            info!(?period, "Stale job monitor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "Stale job sweep failed");
                        }
                    }
                }
            }
            info!("Stale job monitor stopped");
        })
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as if the clock read `now`.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let ctx = &self.ctx;
        let mut report = SweepReport {
            accounts_restored: ctx.accounts.restore_exhausted(now).await?,
            leases_reaped: ctx.accounts.reap_expired_leases(now).await?,
            ..SweepReport::default()
        };

        let cutoff = now
            .checked_sub_signed(ctx.config.stale_cutoff_chrono())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        if ctx.control.is_paused() {
            debug!("Pipeline paused, skipping stale job scan");
        } else if ctx.control.resumed_at().is_some_and(|at| at >= cutoff) {
            debug!("Pipeline resumed within the cutoff, skipping stale job scan");
        } else {
            self.recover_stale(cutoff, &mut report).await?;
        }

        self.log_queue_depths();
        if report != SweepReport::default() {
            info!(?report, "Stale job sweep finished");
        }
        Ok(report)
    }

    async fn recover_stale(&self, cutoff: DateTime<Utc>, report: &mut SweepReport) -> Result<()> {
        let ctx = &self.ctx;
        let stale: Vec<Job> = ctx
            .store
            .list_jobs_by_status(&JobStatus::ACTIVE)
            .await?
            .into_iter()
            .filter(|job| job.updated_at < cutoff && !ctx.queues.is_waiting(job.id))
            .collect();

        for job in stale {
            let job_id = job.id;
            match self.recover(job).await {
                Ok(Recovery::Requeued) => report.requeued += 1,
                Ok(Recovery::Failed) => report.failed += 1,
                Ok(Recovery::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Failed to recover stale job");
                    report.skipped += 1;
                }
            }
        }
        Ok(())
    }

    fn log_queue_depths(&self) {
        let ctx = &self.ctx;
        let depths = ctx.queues.depths();
        debug!(
            generate = depths.generate,
            poll = depths.poll,
            download = depths.download,
            delayed = depths.delayed,
            active_jobs = ctx.queues.active_jobs(),
            "Queue depths"
        );
        for kind in TaskKind::ALL {
            let queue = ctx.queues.queue(kind);
            if queue.depth_status() != QueueDepthStatus::Normal {
                warn!(
                    queue = %kind,
                    depth = queue.len(),
                    capacity = queue.capacity(),
                    status = ?queue.depth_status(),
                    "Task queue backlog"
                );
            }
        }
    }

    async fn recover(&self, job: Job) -> Result<Recovery> {
        let ctx = &self.ctx;
        let expected = job.updated_at;
        let stage = match job.task_state.current_task {
            Stage::Completed => Stage::Download,
            stage => stage,
        };

        let mut updated = job;
        updated.retry_count += 1;
        let has_budget = updated.retry_count < updated.max_retries;
        if let Some(record) = updated.task_state.record_mut(stage) {
            if has_budget {
                record.retry(STALE_REASON);
            } else {
                record.fail(STALE_REASON);
            }
        }
        if has_budget {
            if updated.status != JobStatus::Pending {
                updated.transition(JobStatus::Pending)?;
            }
        } else {
            updated.fail(ErrorKind::StaleJob, STALE_REASON)?;
        }

        let Some(saved) = ctx.store.save_job_if_unchanged(&updated, expected).await? else {
            debug!(job_id = %updated.id, "Stale job changed before recovery, skipping");
            return Ok(Recovery::Skipped);
        };

        ctx.accounts.release_holder(saved.id).await?;

        if saved.status == JobStatus::Failed {
            ctx.queues.release_job(saved.id);
            warn!(
                job_id = %saved.id,
                retries = saved.retry_count,
                "Stale job failed, retry budget exhausted"
            );
            return Ok(Recovery::Failed);
        }

        let epoch = ctx.queues.reclaim(saved.id);
        let purged = ctx.queues.discard_queued(saved.id);
        if purged > 0 {
            debug!(job_id = %saved.id, purged, "Dropped superseded queued tasks");
        }
        let task = Task::for_stage(&saved, stage, epoch);
        info!(
            job_id = %saved.id,
            stage = %stage,
            queue = %task.kind(),
            retry = saved.retry_count,
            "Requeueing stale job"
        );
        ctx.queues.submit(task).await?;
        Ok(Recovery::Requeued)
    }
}
