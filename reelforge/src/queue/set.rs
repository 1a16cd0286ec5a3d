//! The three stage queues plus the registry of jobs with a task in flight.
//!
//! A job is *claimed* while exactly one of its tasks is queued, delayed or
//! executing. Each claim carries an epoch; a task whose epoch no longer
//! matches the registry has been superseded and is dropped by the worker
//! that pulls it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use super::TaskQueue;
use crate::domain::{JobId, Task, TaskKind};
use crate::{Error, Result};

/// Snapshot of queue depths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueDepths {
    pub generate: usize,
    pub poll: usize,
    pub download: usize,
    /// Tasks sleeping before re-enqueue.
    pub delayed: usize,
}

pub struct TaskQueueSet {
    generate: TaskQueue,
    poll: TaskQueue,
    download: TaskQueue,
    claims: DashMap<JobId, u64>,
    next_epoch: AtomicU64,
    enqueue_timeout: Duration,
    delayed: TaskTracker,
    delayed_count: AtomicUsize,
    /// Epoch of the delayed task each job is sleeping on.
    delayed_jobs: DashMap<JobId, u64>,
    cancel: CancellationToken,
}

impl TaskQueueSet {
    pub fn new(capacity: usize, enqueue_timeout: Duration) -> Self {
        Self {
            generate: TaskQueue::new(TaskKind::Generate, capacity),
            poll: TaskQueue::new(TaskKind::Poll, capacity),
            download: TaskQueue::new(TaskKind::Download, capacity),
            claims: DashMap::new(),
            next_epoch: AtomicU64::new(1),
            enqueue_timeout,
            delayed: TaskTracker::new(),
            delayed_count: AtomicUsize::new(0),
            delayed_jobs: DashMap::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn queue(&self, kind: TaskKind) -> &TaskQueue {
        match kind {
            TaskKind::Generate => &self.generate,
            TaskKind::Poll => &self.poll,
            TaskKind::Download => &self.download,
        }
    }

    fn fresh_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed)
    }

    /// Register `job_id` as active and return its epoch.
    pub fn claim(&self, job_id: JobId) -> Result<u64> {
        match self.claims.entry(job_id) {
            Entry::Occupied(_) => Err(Error::AlreadyQueued { job_id }),
            Entry::Vacant(slot) => {
                let epoch = self.fresh_epoch();
                slot.insert(epoch);
                Ok(epoch)
            }
        }
    }

    /// Claim `job_id` with a new epoch, superseding any task already in flight.
    pub fn reclaim(&self, job_id: JobId) -> u64 {
        let epoch = self.fresh_epoch();
        self.claims.insert(job_id, epoch);
        epoch
    }

    /// Drop the claim on `job_id` if it still carries `epoch`.
    pub fn release(&self, job_id: JobId, epoch: u64) -> bool {
        self.claims.remove_if(&job_id, |_, e| *e == epoch).is_some()
    }

    /// Drop the claim on `job_id` whatever its epoch.
    pub fn release_job(&self, job_id: JobId) -> bool {
        self.claims.remove(&job_id).is_some()
    }

    pub fn is_claimed(&self, job_id: JobId) -> bool {
        self.claims.contains_key(&job_id)
    }

    /// Whether `task` still owns its job's claim.
    pub fn is_current(&self, task: &Task) -> bool {
        self.claims
            .get(&task.job_id)
            .is_some_and(|epoch| *epoch == task.epoch)
    }

    /// Whether the job's current task is queued or sleeping before
    /// re-enqueue, as opposed to executing or lost.
    pub fn is_waiting(&self, job_id: JobId) -> bool {
        let Some(epoch) = self.claims.get(&job_id).map(|e| *e) else {
            return false;
        };
        self.delayed_jobs.get(&job_id).is_some_and(|e| *e == epoch)
            || TaskKind::ALL
                .iter()
                .any(|kind| self.queue(*kind).contains(job_id, epoch))
    }

    /// Drop every queued task for `job_id`. Returns how many were removed.
    pub fn discard_queued(&self, job_id: JobId) -> usize {
        TaskKind::ALL
            .iter()
            .map(|kind| self.queue(*kind).remove_job(job_id))
            .sum()
    }

    pub fn active_jobs(&self) -> usize {
        self.claims.len()
    }

    /// Enqueue `task` on its stage queue, waiting for space up to the
    /// configured enqueue timeout.
    pub async fn submit(&self, task: Task) -> Result<()> {
        let kind = task.kind();
        debug!(job_id = %task.job_id, queue = %kind, attempt = task.attempt, "Task enqueued");
        self.queue(kind).push(task, self.enqueue_timeout).await
    }

    /// Enqueue `task` once `delay` has elapsed.
    ///
    /// The task is dropped if its claim was superseded while it slept, or if
    /// the set shuts down first.
    pub fn submit_after(self: &Arc<Self>, task: Task, delay: Duration) {
        let this = Arc::clone(self);
        this.delayed_count.fetch_add(1, Ordering::Relaxed);
        let (job_id, epoch) = (task.job_id, task.epoch);
        this.delayed_jobs.insert(job_id, epoch);
        self.delayed.spawn(async move {
            tokio::select! {
                _ = this.cancel.cancelled() => {
                    this.delayed_jobs.remove_if(&job_id, |_, e| *e == epoch);
                    debug!(job_id = %job_id, "Delayed task dropped on shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    // Cleared before the push; the next sleep for this epoch may
                    // be scheduled as soon as the task is pulled.
                    this.delayed_jobs.remove_if(&job_id, |_, e| *e == epoch);
                    if this.is_current(&task) {
                        if let Err(e) = this.submit(task).await {
                            error!(job_id = %job_id, error = %e, "Failed to re-enqueue delayed task");
                        }
                    }
                }
            }
            this.delayed_count.fetch_sub(1, Ordering::Relaxed);
        });
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            generate: self.generate.len(),
            poll: self.poll.len(),
            download: self.download.len(),
            delayed: self.delayed_count.load(Ordering::Relaxed),
        }
    }

    /// Drain every queue and forget every claim.
    ///
    /// Delayed tasks are not cancelled; with their claims gone they are dropped
    /// when they wake. Returns the number of queued tasks discarded.
    pub fn clear(&self) -> usize {
        let discarded = TaskKind::ALL
            .iter()
            .map(|kind| self.queue(*kind).drain().len())
            .sum();
        self.claims.clear();
        self.delayed_jobs.clear();
        discarded
    }

    /// Cancel delayed re-enqueues and wait for their tasks to exit.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.delayed.close();
        self.delayed.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> Arc<TaskQueueSet> {
        Arc::new(TaskQueueSet::new(10, Duration::from_millis(50)))
    }

    #[test]
    fn test_claim_is_exclusive() {
        let queues = set();
        let epoch = queues.claim(JobId(1)).unwrap();
        assert!(matches!(
            queues.claim(JobId(1)),
            Err(Error::AlreadyQueued { job_id: JobId(1) })
        ));

        assert!(queues.release(JobId(1), epoch));
        assert!(queues.claim(JobId(1)).is_ok());
    }

    #[test]
    fn test_reclaim_supersedes_old_tasks() {
        let queues = set();
        let old_epoch = queues.claim(JobId(1)).unwrap();
        let old_task = Task::generate(JobId(1), old_epoch, vec![]);
        assert!(queues.is_current(&old_task));

        let new_epoch = queues.reclaim(JobId(1));
        assert!(!queues.is_current(&old_task));
        assert!(queues.is_current(&Task::generate(JobId(1), new_epoch, vec![])));

        // A stale holder cannot release the new claim.
        assert!(!queues.release(JobId(1), old_epoch));
        assert!(queues.is_claimed(JobId(1)));
    }

    #[tokio::test]
    async fn test_submit_routes_by_kind() {
        let queues = set();
        let epoch = queues.claim(JobId(1)).unwrap();
        queues
            .submit(Task::poll(JobId(1), epoch, crate::domain::AccountId(1), "t-1"))
            .await
            .unwrap();

        let depths = queues.depths();
        assert_eq!(depths.poll, 1);
        assert_eq!(depths.generate, 0);
        assert_eq!(queues.active_jobs(), 1);
    }

    #[tokio::test]
    async fn test_submit_after_delays_and_respects_epoch() {
        let queues = set();
        let epoch = queues.claim(JobId(1)).unwrap();
        queues.submit_after(Task::generate(JobId(1), epoch, vec![]), Duration::from_millis(20));
        assert_eq!(queues.depths().delayed, 1);
        assert_eq!(queues.depths().generate, 0);

        let pulled = queues
            .queue(TaskKind::Generate)
            .pull(Duration::from_secs(2))
            .await;
        assert_eq!(pulled.unwrap().job_id, JobId(1));

        // Superseded while sleeping: never enqueued.
        queues.submit_after(Task::generate(JobId(1), epoch, vec![]), Duration::from_millis(10));
        queues.reclaim(JobId(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queues.depths().generate, 0);
        assert_eq!(queues.depths().delayed, 0);
    }

    #[tokio::test]
    async fn test_clear_and_shutdown() {
        let queues = set();
        for job in 1..=3 {
            let epoch = queues.claim(JobId(job)).unwrap();
            queues
                .submit(Task::generate(JobId(job), epoch, vec![]))
                .await
                .unwrap();
        }
        let epoch = queues.claim(JobId(9)).unwrap();
        queues.submit_after(Task::generate(JobId(9), epoch, vec![]), Duration::from_secs(60));

        assert_eq!(queues.clear(), 3);
        assert_eq!(queues.active_jobs(), 0);

        tokio::time::timeout(Duration::from_secs(2), queues.shutdown())
            .await
            .unwrap();
        assert_eq!(queues.depths(), QueueDepths::default());
    }

    #[tokio::test]
    async fn test_waiting_tracks_queued_and_delayed_tasks() {
        let queues = set();
        let epoch = queues.claim(JobId(1)).unwrap();
        assert!(!queues.is_waiting(JobId(1)));

        queues.submit_after(Task::generate(JobId(1), epoch, vec![]), Duration::from_millis(20));
        assert!(queues.is_waiting(JobId(1)));

        let task = queues
            .queue(TaskKind::Generate)
            .pull(Duration::from_secs(2))
            .await
            .unwrap();
        // Pulled by a worker: executing, not waiting.
        assert!(!queues.is_waiting(JobId(1)));

        queues.submit(task).await.unwrap();
        assert!(queues.is_waiting(JobId(1)));

        // A queued task from an older epoch does not count, and is purged.
        let new_epoch = queues.reclaim(JobId(1));
        assert!(!queues.is_waiting(JobId(1)));
        assert_eq!(queues.discard_queued(JobId(1)), 1);
        queues
            .submit(Task::generate(JobId(1), new_epoch, vec![]))
            .await
            .unwrap();
        assert!(queues.is_waiting(JobId(1)));
        assert_eq!(queues.depths().generate, 1);
    }
}
