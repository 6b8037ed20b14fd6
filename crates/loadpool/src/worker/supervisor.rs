//! Worker supervision
//!
//! The supervisor owns every worker task. Each worker gets a watcher task
//! that reports how the worker ended; the supervision loop turns every
//! exit into an atomic replacement followed by orphan reaping.
//!
//! Replacement and reaping run under the registry's exclusive membership
//! gate, so no dispatch can tag a job for the dead worker in between.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::processor::{panic_message, JobProcessor, WorkerContext};
use crate::events::{PoolEvent, RetryExhausted, WorkerExit};
use crate::queue::{JobRecord, JobStatus, QueueError};
use crate::registry::{RegistryError, WorkerId};
use crate::reliability::{RestartBudget, RestartTracker, RetryDecision};

/// Error recorded on jobs whose running attempt died with its worker
pub const WORKER_LOST: &str = "worker lost";

/// Supervisor errors
///
/// Everything except `UnknownWorker` and `ShuttingDown` is fatal to the pool.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// Registry accounting defect during replacement or reaping
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// The queue failed while re-homing orphaned jobs
    #[error("failed to reap orphaned jobs: {0}")]
    Reap(#[source] QueueError),

    /// Workers are dying faster than the budget allows
    #[error("restart budget exhausted: more than {max_restarts} restarts within {window:?}")]
    RestartBudgetExhausted { max_restarts: u32, window: Duration },

    /// No supervised worker with this id
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// The supervisor is stopping
    #[error("supervisor is shutting down")]
    ShuttingDown,

    /// `start` or `run` called twice
    #[error("supervisor already started")]
    AlreadyStarted,
}

struct WorkerHandle {
    abort: AbortHandle,
    watcher: JoinHandle<()>,
}

/// Keeps `worker_count` workers alive
pub struct Supervisor {
    ctx: Arc<WorkerContext>,
    worker_count: usize,
    next_id: AtomicU64,
    workers: Mutex<HashMap<WorkerId, WorkerHandle>>,
    restarts: Mutex<RestartTracker>,
    exit_tx: mpsc::UnboundedSender<(WorkerId, WorkerExit)>,
    exit_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(WorkerId, WorkerExit)>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(ctx: Arc<WorkerContext>, worker_count: usize, restart_budget: RestartBudget) -> Self {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        Self {
            ctx,
            worker_count,
            next_id: AtomicU64::new(1),
            workers: Mutex::new(HashMap::new()),
            restarts: Mutex::new(RestartTracker::new(restart_budget)),
            exit_tx,
            exit_rx: tokio::sync::Mutex::new(exit_rx),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register and spawn the initial workers
    ///
    /// Each worker is in the registry before its task exists, so it can
    /// be selected as soon as `start` returns.
    pub fn start(&self) -> Result<(), SupervisorError> {
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyStarted);
        }

        for _ in 0..self.worker_count {
            let worker_id = self.allocate_id();
            self.ctx.registry.register(worker_id)?;
            self.launch(worker_id);
        }

        info!(worker_count = self.worker_count, "Supervisor started workers");
        Ok(())
    }

    /// Supervise until shutdown or a fatal error
    pub async fn run(&self) -> Result<(), SupervisorError> {
        let Ok(mut exits) = self.exit_rx.try_lock() else {
            return Err(SupervisorError::AlreadyStarted);
        };

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    debug!("Supervisor: shutdown requested");
                    return Ok(());
                }
                exit = exits.recv() => {
                    let Some((worker_id, exit)) = exit else {
                        return Ok(());
                    };
                    self.handle_exit(worker_id, exit).await?;
                }
            }
        }
    }

    /// Abort a worker's task, as if it crashed
    ///
    /// The worker is replaced through the normal exit path.
    pub fn kill(&self, worker_id: WorkerId) -> Result<(), SupervisorError> {
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::ShuttingDown);
        }
        let workers = self.workers.lock();
        let handle = workers
            .get(&worker_id)
            .ok_or(SupervisorError::UnknownWorker(worker_id))?;
        warn!(%worker_id, "Killing worker");
        handle.abort.abort();
        Ok(())
    }

    /// Ids of supervised workers, ascending
    pub fn live_workers(&self) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self.workers.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Token cancelled when the supervisor stops
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the supervision loop without touching the workers
    pub fn cancel(&self) {
        self.shutdown.cancel();
    }

    /// Stop every worker, letting in-flight jobs drain until `timeout`
    ///
    /// Workers still running at the deadline are aborted. Returns `true`
    /// if every worker drained in time. All workers are deregistered.
    pub async fn stop_workers(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();

        let handles: Vec<(WorkerId, WorkerHandle)> = self.workers.lock().drain().collect();
        let deadline = Instant::now() + timeout;
        let mut drained = true;

        for (worker_id, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle.watcher)
                .await
                .is_err()
            {
                warn!(%worker_id, "Worker did not drain in time, aborting");
                handle.abort.abort();
                let _ = handle.watcher.await;
                drained = false;
            }

            if let Err(e) = self.ctx.registry.deregister(worker_id) {
                error!(%worker_id, error = %e, "Failed to deregister stopped worker");
            }
        }

        info!(drained, "Supervisor stopped workers");
        drained
    }

    fn allocate_id(&self) -> WorkerId {
        WorkerId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn launch(&self, worker_id: WorkerId) {
        let processor = JobProcessor::new(worker_id, Arc::clone(&self.ctx));
        let task = tokio::spawn(processor.run(self.shutdown.child_token()));
        let abort = task.abort_handle();

        let exits = self.exit_tx.clone();
        let watcher = tokio::spawn(async move {
            let exit = match task.await {
                Ok(()) => WorkerExit::Returned,
                Err(e) if e.is_panic() => WorkerExit::Panicked(panic_message(&*e.into_panic())),
                Err(_) => WorkerExit::Aborted,
            };
            let _ = exits.send((worker_id, exit));
        });

        self.workers
            .lock()
            .insert(worker_id, WorkerHandle { abort, watcher });
        self.ctx.events.publish(PoolEvent::WorkerStarted { worker_id });
        debug!(%worker_id, "Worker launched");
    }

    #[instrument(skip(self), fields(dead = %dead))]
    async fn handle_exit(&self, dead: WorkerId, exit: WorkerExit) -> Result<(), SupervisorError> {
        if !self.workers.lock().contains_key(&dead) {
            debug!("Exit from a worker that is no longer supervised");
            return Ok(());
        }

        warn!(exit = %exit, "Worker exited");
        self.ctx.events.publish(PoolEvent::WorkerExited {
            worker_id: dead,
            exit,
        });

        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let result = self.restart(dead).await;
        if result.is_err() {
            self.retire(dead).await;
        }
        result
    }

    async fn restart(&self, dead: WorkerId) -> Result<(), SupervisorError> {
        {
            let mut restarts = self.restarts.lock();
            if !restarts.try_record(Instant::now()) {
                let budget = restarts.budget();
                error!(
                    max_restarts = budget.max_restarts,
                    window_ms = budget.window.as_millis() as u64,
                    "Restart budget exhausted"
                );
                return Err(SupervisorError::RestartBudgetExhausted {
                    max_restarts: budget.max_restarts,
                    window: budget.window,
                });
            }
        }

        let _gate = self.ctx.registry.membership_exclusive().await;

        let replacement = self.allocate_id();
        let record = self.ctx.registry.replace(dead, replacement)?;
        self.launch(replacement);
        self.workers.lock().remove(&dead);

        let orphaned_jobs = self.reap(dead).await?;

        info!(
            %replacement,
            dropped_load = record.active_job_count,
            orphaned_jobs,
            "Worker replaced"
        );
        self.ctx.events.publish(PoolEvent::WorkerReplaced {
            dead,
            replacement,
            orphaned_jobs,
        });
        Ok(())
    }

    /// Drop a dead worker that will not be replaced
    ///
    /// Its orphans move to the remaining workers when there are any.
    async fn retire(&self, dead: WorkerId) {
        let _gate = self.ctx.registry.membership_exclusive().await;

        self.workers.lock().remove(&dead);
        if self.ctx.registry.contains(dead) {
            if let Err(e) = self.ctx.registry.deregister(dead) {
                error!(error = %e, "Failed to deregister dead worker");
            }
        }

        if self.ctx.registry.is_empty() {
            match self.ctx.queue.orphaned(dead).await {
                Ok(orphans) if !orphans.is_empty() => {
                    warn!(stranded = orphans.len(), "No workers left to take orphaned jobs");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to look up orphaned jobs"),
            }
            return;
        }

        match self.reap(dead).await {
            Ok(orphaned_jobs) => info!(orphaned_jobs, "Dead worker retired"),
            Err(e) => error!(error = %e, "Failed to reap retired worker"),
        }
    }

    /// Re-home every job still tagged for `dead`
    ///
    /// Must run under the exclusive membership gate. Returns how many jobs
    /// were moved or failed.
    async fn reap(&self, dead: WorkerId) -> Result<usize, SupervisorError> {
        let orphans = self
            .ctx
            .queue
            .orphaned(dead)
            .await
            .map_err(SupervisorError::Reap)?;

        let mut reaped = 0;
        for job in orphans {
            let attempt_count = match job.status {
                JobStatus::Pending => job.attempt_count,
                JobStatus::Running => {
                    match self
                        .ctx
                        .retry_policy_for(job.max_attempts)
                        .decide(job.attempt_count)
                    {
                        RetryDecision::Retry { next_attempt, .. } => next_attempt,
                        RetryDecision::Exhausted => {
                            if self.fail_lost(dead, &job).await? {
                                reaped += 1;
                            }
                            continue;
                        }
                    }
                }
                _ => continue,
            };

            if self.rehome(dead, &job, attempt_count).await? {
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn rehome(
        &self,
        dead: WorkerId,
        job: &JobRecord,
        attempt_count: u32,
    ) -> Result<bool, SupervisorError> {
        let job_id = job.id;
        let to = self.ctx.registry.assign_least()?;

        match self.ctx.queue.reassign(job_id, to, attempt_count).await {
            Ok(()) => {
                debug!(%job_id, from = %dead, %to, attempt_count, "Orphaned job reassigned");
                self.ctx.events.publish(PoolEvent::JobReassigned {
                    job_id,
                    from: dead,
                    to,
                    attempt_count,
                });
                Ok(true)
            }
            Err(e) => {
                self.ctx.registry.adjust(to, -1)?;
                if finished_concurrently(&e) {
                    debug!(%job_id, error = %e, "Orphaned job finished before reaping");
                    Ok(false)
                } else {
                    Err(SupervisorError::Reap(e))
                }
            }
        }
    }

    async fn fail_lost(&self, dead: WorkerId, job: &JobRecord) -> Result<bool, SupervisorError> {
        let job_id = job.id;
        match self.ctx.queue.fail(job_id, WORKER_LOST).await {
            Ok(()) => {
                let failure = RetryExhausted {
                    job_id,
                    worker_id: dead,
                    attempts: job.attempt_count + 1,
                    last_error: WORKER_LOST.to_string(),
                };
                error!(%job_id, worker_id = %dead, "{failure}");
                self.ctx.events.publish(PoolEvent::JobFailed(failure));
                Ok(true)
            }
            Err(e) if finished_concurrently(&e) => {
                debug!(%job_id, error = %e, "Orphaned job finished before reaping");
                Ok(false)
            }
            Err(e) => Err(SupervisorError::Reap(e)),
        }
    }
}

/// An aborted worker's last job can still settle while it is being reaped
fn finished_concurrently(err: &QueueError) -> bool {
    matches!(
        err,
        QueueError::JobNotFound(_) | QueueError::InvalidTransition { .. }
    )
}
