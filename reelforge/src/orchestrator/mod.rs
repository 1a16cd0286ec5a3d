//! Orchestrator: the control surface over jobs, queues and workers.
//!
//! The orchestrator owns three [`StagePool`]s and the [`StaleJobMonitor`].
//! All shared state lives in the [`OrchestratorContext`] it was built from.

pub mod context;
pub mod control;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{ErrorKind, Job, JobId, JobStatus, NewJob, Task, TaskKind};
use crate::monitor::StaleJobMonitor;
use crate::queue::QueueDepths;
use crate::worker::{StagePool, handler_for};
use crate::{Error, Result};

pub use context::OrchestratorContext;
pub use control::PauseControl;

/// Attempts at a compare-and-swap write from the control surface.
const CONTROL_WRITE_ATTEMPTS: u32 = 5;

const DEFAULT_CANCEL_REASON: &str = "cancelled by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BulkAction {
    Start,
    Retry,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BulkFailure {
    pub job_id: JobId,
    pub kind: Option<ErrorKind>,
    pub message: String,
}

/// Per-id results of a bulk action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    pub succeeded: Vec<JobId>,
    pub failed: Vec<BulkFailure>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResetReport {
    pub leases_released: usize,
    pub jobs_reset: usize,
    pub tasks_discarded: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub paused: bool,
    pub pause_reason: Option<String>,
    pub queue_depths: QueueDepths,
    pub active_jobs: usize,
}

pub struct Orchestrator {
    ctx: Arc<OrchestratorContext>,
    pools: Vec<StagePool>,
    monitor: Arc<StaleJobMonitor>,
    monitor_cancel: CancellationToken,
    monitor_handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Orchestrator {
    pub fn new(ctx: OrchestratorContext) -> Self {
        let ctx = Arc::new(ctx);
        let pools = TaskKind::ALL
            .iter()
            .map(|kind| StagePool::new(*kind, ctx.config.max_concurrent.for_kind(*kind)))
            .collect();
        Self {
            monitor: Arc::new(StaleJobMonitor::new(ctx.clone())),
            ctx,
            pools,
            monitor_cancel: CancellationToken::new(),
            monitor_handle: parking_lot::Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn context(&self) -> &Arc<OrchestratorContext> {
        &self.ctx
    }

    pub fn monitor(&self) -> &Arc<StaleJobMonitor> {
        &self.monitor
    }

    /// Start the stage pools, requeue work left by a previous process and
    /// start the stale job monitor.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already started");
            return Ok(());
        }
        for pool in &self.pools {
            pool.start(self.ctx.clone(), handler_for(pool.kind()));
        }

        let resumed = self.recover().await?;
        info!(resumed, "Orchestrator started");

        let handle = self.monitor.clone().spawn(self.monitor_cancel.clone());
        *self.monitor_handle.lock() = Some(handle);
        Ok(())
    }

    /// Release leases from a previous process and requeue every active job at
    /// its recorded stage. No retry budget is consumed.
    async fn recover(&self) -> Result<usize> {
        let ctx = &self.ctx;
        let released = ctx.accounts.release_all().await?;
        if released > 0 {
            info!(released, "Released account leases from a previous run");
        }

        let mut resumed = 0;
        for job in ctx.store.list_jobs_by_status(&JobStatus::ACTIVE).await? {
            let Ok(epoch) = ctx.queues.claim(job.id) else {
                continue;
            };
            let task = Task::for_stage(&job, job.task_state.current_task, epoch);
            let queue = task.kind();
            match ctx.queues.submit(task).await {
                Ok(()) => {
                    debug!(job_id = %job.id, status = %job.status, queue = %queue, "Resumed job");
                    resumed += 1;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Could not resume job, leaving it for stale recovery");
                    ctx.queues.release(job.id, epoch);
                }
            }
        }
        Ok(resumed)
    }

    /// Stop the monitor and the pools, then drop delayed re-enqueues.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.monitor_cancel.cancel();
        let monitor = self.monitor_handle.lock().take();
        if let Some(handle) = monitor {
            if let Err(e) = handle.await {
                warn!(error = %e, "Stale job monitor exited abnormally");
            }
        }

        let grace = self.ctx.config.shutdown_grace;
        futures::future::join_all(self.pools.iter().map(|pool| pool.stop(grace))).await;
        self.ctx.queues.shutdown().await;
        info!("Orchestrator stopped");
    }

    /// Validate and store a new draft job.
    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        new.spec.validate()?;
        let max_retries = new
            .max_retries
            .unwrap_or(self.ctx.config.default_max_retries);
        let job = self.ctx.store.insert_job(new, max_retries).await?;
        debug!(job_id = %job.id, platform = %job.spec.platform, "Job created");
        Ok(job)
    }

    /// Queue a draft or pending job.
    pub async fn start_job(&self, id: JobId) -> Result<Job> {
        let ctx = &self.ctx;
        let mut job = ctx.store.load_job(id).await?;
        if !job.can_start() {
            return Err(Error::InvalidTransition {
                from: job.status,
                to: JobStatus::Pending,
            });
        }
        if !ctx.accounts.has_eligible(&job.spec.platform).await? {
            return Err(Error::AccountUnavailable {
                platform: job.spec.platform.clone(),
            });
        }

        let epoch = ctx.queues.claim(id)?;
        let queued = async {
            if job.status == JobStatus::Draft {
                job.transition(JobStatus::Pending)?;
                job.task_state = Default::default();
            }
            let job = ctx.store.save_job(&job).await?;
            let task = Task::for_stage(&job, job.task_state.current_task, epoch);
            ctx.queues.submit(task).await?;
            Ok::<_, Error>(job)
        }
        .await;

        match queued {
            Ok(job) => {
                info!(job_id = %job.id, platform = %job.spec.platform, "Job started");
                Ok(job)
            }
            Err(e) => {
                ctx.queues.release(id, epoch);
                Err(e)
            }
        }
    }

    /// Reset a failed or cancelled job and start it again.
    pub async fn retry_job(&self, id: JobId) -> Result<Job> {
        let ctx = &self.ctx;
        let mut job = ctx.store.load_job(id).await?;
        job.reset_for_retry()?;
        ctx.store.save_job(&job).await?;
        // Supersede anything a cancelled run still has in flight.
        ctx.queues.release_job(id);
        info!(job_id = %id, "Job reset for retry");
        self.start_job(id).await
    }

    /// Cancel an active job. A task already talking to the provider finishes
    /// its call but does not commit.
    pub async fn cancel_job(&self, id: JobId, reason: Option<String>) -> Result<Job> {
        let ctx = &self.ctx;
        let reason = reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

        for _ in 0..CONTROL_WRITE_ATTEMPTS {
            let mut job = ctx.store.load_job(id).await?;
            let expected = job.updated_at;
            job.cancel(reason.clone())?;
            if let Some(saved) = ctx.store.save_job_if_unchanged(&job, expected).await? {
                ctx.queues.release_job(id);
                info!(job_id = %id, reason = %reason, "Job cancelled");
                return Ok(saved);
            }
        }
        Err(Error::Other(format!("job {id} kept changing while cancelling")))
    }

    /// Apply `action` to every id, collecting per-id failures.
    pub async fn bulk(&self, action: BulkAction, ids: &[JobId]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for &id in ids {
            let result = match action {
                BulkAction::Start => self.start_job(id).await,
                BulkAction::Retry => self.retry_job(id).await,
                BulkAction::Cancel => self.cancel_job(id, None).await,
            };
            match result {
                Ok(_) => outcome.succeeded.push(id),
                Err(e) => outcome.failed.push(BulkFailure {
                    job_id: id,
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }
        info!(
            action = %action,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "Bulk action finished"
        );
        outcome
    }

    pub fn pause(&self, reason: Option<String>) {
        if self.ctx.control.pause(reason.clone()) {
            info!(reason = ?reason, "Task processing paused");
        }
    }

    pub fn resume(&self) {
        if self.ctx.control.resume() {
            info!("Task processing resumed");
        }
    }

    /// Drop every queued task and lease, and move processing-like jobs back
    /// to `pending`. Nothing is requeued.
    pub async fn reset(&self) -> Result<ResetReport> {
        let ctx = &self.ctx;
        let tasks_discarded = ctx.queues.clear();
        let leases_released = ctx.accounts.release_all().await?;

        let mut jobs_reset = 0;
        for job in ctx
            .store
            .list_jobs_by_status(&JobStatus::PROCESSING_LIKE)
            .await?
        {
            let expected = job.updated_at;
            let mut job = job;
            job.transition(JobStatus::Pending)?;
            match ctx.store.save_job_if_unchanged(&job, expected).await? {
                Some(_) => jobs_reset += 1,
                None => warn!(job_id = %job.id, "Job changed during reset, left as is"),
            }
        }

        let report = ResetReport {
            leases_released,
            jobs_reset,
            tasks_discarded,
        };
        warn!(?report, "Orchestrator state reset");
        Ok(report)
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            paused: self.ctx.control.is_paused(),
            pause_reason: self.ctx.control.reason(),
            queue_depths: self.ctx.queues.depths(),
            active_jobs: self.ctx.queues.active_jobs(),
        }
    }
}
