//! Bounded FIFO queue for one pipeline stage.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};
use tracing::warn;

use crate::domain::{JobId, Task, TaskKind};
use crate::{Error, Result};

/// Fraction of capacity at which the queue reports `Warning`.
const WARNING_RATIO: f64 = 0.8;

/// Fill level of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueDepthStatus {
    Normal,
    Warning,
    Full,
}

pub struct TaskQueue {
    kind: TaskKind,
    capacity: usize,
    tasks: Mutex<VecDeque<Task>>,
    /// Signalled when a task is pushed.
    available: Notify,
    /// Signalled when a task is removed.
    space: Notify,
}

impl TaskQueue {
    pub fn new(kind: TaskKind, capacity: usize) -> Self {
        Self {
            kind,
            capacity: capacity.max(1),
            tasks: Mutex::new(VecDeque::new()),
            available: Notify::new(),
            space: Notify::new(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    pub fn depth_status(&self) -> QueueDepthStatus {
        let depth = self.len();
        if depth >= self.capacity {
            QueueDepthStatus::Full
        } else if depth as f64 >= self.capacity as f64 * WARNING_RATIO {
            QueueDepthStatus::Warning
        } else {
            QueueDepthStatus::Normal
        }
    }

    fn push_inner(&self, task: Task) -> std::result::Result<usize, Task> {
        let depth = {
            let mut tasks = self.tasks.lock();
            if tasks.len() >= self.capacity {
                return Err(task);
            }
            tasks.push_back(task);
            tasks.len()
        };
        self.available.notify_one();
        Ok(depth)
    }

    fn warn_if_filling(&self, depth: usize) {
        if depth as f64 >= self.capacity as f64 * WARNING_RATIO {
            warn!(
                queue = %self.kind,
                depth,
                capacity = self.capacity,
                "Task queue nearly full"
            );
        }
    }

    /// Append `task` without waiting.
    pub fn try_push(&self, task: Task) -> Result<()> {
        match self.push_inner(task) {
            Ok(depth) => {
                self.warn_if_filling(depth);
                Ok(())
            }
            Err(_) => Err(Error::QueueFull {
                queue: self.kind,
                capacity: self.capacity,
            }),
        }
    }

    /// Append `task`, waiting up to `wait` for space.
    pub async fn push(&self, task: Task, wait: Duration) -> Result<()> {
        let deadline = Instant::now() + wait;
        let mut task = task;
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.push_inner(task) {
                Ok(depth) => {
                    self.warn_if_filling(depth);
                    return Ok(());
                }
                Err(rejected) => task = rejected,
            }

            if timeout_at(deadline, notified).await.is_err() {
                return self.try_push(task);
            }
        }
    }

    /// Put a task back at the head, ahead of newer work.
    ///
    /// Used for a task pulled just before the queue was paused; it may briefly
    /// exceed capacity by one.
    pub fn push_front(&self, task: Task) {
        self.tasks.lock().push_front(task);
        self.available.notify_one();
    }

    pub fn try_pull(&self) -> Option<Task> {
        let task = self.tasks.lock().pop_front();
        if task.is_some() {
            self.space.notify_one();
        }
        task
    }

    /// Take the oldest task, waiting up to `wait` for one to arrive.
    pub async fn pull(&self, wait: Duration) -> Option<Task> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_pull() {
                return Some(task);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.try_pull();
            }
        }
    }

    /// Whether a task for `job_id` carrying `epoch` is waiting here.
    pub fn contains(&self, job_id: JobId, epoch: u64) -> bool {
        self.tasks
            .lock()
            .iter()
            .any(|task| task.job_id == job_id && task.epoch == epoch)
    }

    /// Drop every queued task for `job_id`. Returns how many were removed.
    pub fn remove_job(&self, job_id: JobId) -> usize {
        let removed = {
            let mut tasks = self.tasks.lock();
            let before = tasks.len();
            tasks.retain(|task| task.job_id != job_id);
            before - tasks.len()
        };
        if removed > 0 {
            self.space.notify_waiters();
        }
        removed
    }

    /// Remove every queued task.
    pub fn drain(&self) -> Vec<Task> {
        let drained: Vec<Task> = self.tasks.lock().drain(..).collect();
        if !drained.is_empty() {
            self.space.notify_waiters();
        }
        drained
    }
}
