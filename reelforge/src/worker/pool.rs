//! Bounded dispatcher for one stage queue.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{StageHandler, fail_internal};
use crate::domain::TaskKind;
use crate::orchestrator::OrchestratorContext;

/// Pulls tasks from one queue and runs at most `max_concurrent` of them at
/// a time.
pub struct StagePool {
    kind: TaskKind,
    max_concurrent: usize,
    cancellation_token: CancellationToken,
    dispatcher: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl StagePool {
    pub fn new(kind: TaskKind, max_concurrent: usize) -> Self {
        Self {
            kind,
            max_concurrent: max_concurrent.max(1),
            cancellation_token: CancellationToken::new(),
            dispatcher: parking_lot::Mutex::new(None),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.lock().is_some() && !self.cancellation_token.is_cancelled()
    }

    /// Spawn the dispatcher loop.
    pub fn start(&self, ctx: Arc<OrchestratorContext>, handler: Arc<dyn StageHandler>) {
        let mut dispatcher = self.dispatcher.lock();
        if dispatcher.is_some() {
            warn!(queue = %self.kind, "Stage pool already started");
            return;
        }

        if handler.kind() != self.kind {
            warn!(
                queue = %self.kind,
                handler = %handler.kind(),
                "Stage handler does not match its queue"
            );
        }
        info!(
            queue = %self.kind,
            max_concurrent = self.max_concurrent,
            "Starting stage pool"
        );
        let kind = self.kind;
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let cancel = self.cancellation_token.clone();
        *dispatcher = Some(tokio::spawn(dispatch(
            kind, ctx, handler, semaphore, cancel,
        )));
    }

    /// Stop pulling, then wait up to `grace` for in-flight tasks before
    /// aborting them.
    pub async fn stop(&self, grace: Duration) {
        info!(queue = %self.kind, "Stopping stage pool");
        self.cancellation_token.cancel();

        let dispatcher = self.dispatcher.lock().take();
        let Some(dispatcher) = dispatcher else {
            return;
        };

        let abort = dispatcher.abort_handle();
        match tokio::time::timeout(grace, dispatcher).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(queue = %self.kind, error = %e, "Stage dispatcher failed"),
            Err(_) => {
                warn!(
                    queue = %self.kind,
                    ?grace,
                    "Grace period elapsed, aborting in-flight tasks"
                );
                // Dropping the dispatcher's JoinSet aborts its tasks.
                abort.abort();
            }
        }
        info!(queue = %self.kind, "Stage pool stopped");
    }
}

async fn dispatch(
    kind: TaskKind,
    ctx: Arc<OrchestratorContext>,
    handler: Arc<dyn StageHandler>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    let queue = ctx.queues.queue(kind);
    let pull_timeout = ctx.config.worker_pull_timeout;
    let mut in_flight: JoinSet<()> = JoinSet::new();

    loop {
        while let Some(result) = in_flight.try_join_next() {
            reap(kind, result);
        }
        if cancel.is_cancelled() {
            break;
        }

        if semaphore.available_permits() == 0 {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(result) = in_flight.join_next() => reap(kind, result),
            }
            continue;
        }

        if ctx.control.is_paused() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ctx.control.wait_until_resumed() => {}
            }
            continue;
        }

        let task = tokio::select! {
            _ = cancel.cancelled() => break,
            task = queue.pull(pull_timeout) => task,
        };
        let Some(task) = task else {
            continue;
        };

        // Paused between the check and the pull: put it back untouched.
        if ctx.control.is_paused() {
            queue.push_front(task);
            continue;
        }
        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            queue.push_front(task);
            continue;
        };

        debug!(queue = %kind, job_id = %task.job_id, attempt = task.attempt, "Dispatching task");
        let ctx = ctx.clone();
        let handler = handler.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            if let Err(e) = handler.handle(&ctx, task.clone()).await {
                fail_internal(&ctx, &task, &e).await;
            }
        });
    }

    debug!(queue = %kind, in_flight = in_flight.len(), "Draining in-flight tasks");
    while let Some(result) = in_flight.join_next().await {
        reap(kind, result);
    }
}

fn reap(kind: TaskKind, result: Result<(), JoinError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!(queue = %kind, error = %e, "Stage task panicked"),
        Err(e) => debug!(queue = %kind, error = %e, "Stage task cancelled"),
    }
}
