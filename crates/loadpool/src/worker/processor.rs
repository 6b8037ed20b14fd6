//! Per-worker job processing
//!
//! Each worker runs one [`JobProcessor`]. It claims jobs tagged for its
//! worker, runs them under a concurrency limit and reports every outcome
//! back to the load registry and the queue.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::handler::{JobHandler, JobResult};
use super::poller::{JobPoller, PollerConfig};
use crate::events::{EventBus, PoolEvent, RetryExhausted};
use crate::queue::{ClaimedJob, JobId, JobQueue};
use crate::registry::{LoadRegistry, WorkerId};
use crate::reliability::{RetryDecision, RetryPolicy};

/// Everything a worker needs, shared by all workers of a pool
#[derive(Clone)]
pub struct WorkerContext {
    pub registry: Arc<LoadRegistry>,
    pub queue: Arc<dyn JobQueue>,
    pub queue_name: String,
    pub handler: JobHandler,
    pub retry_policy: RetryPolicy,
    pub concurrency: usize,
    pub poller: PollerConfig,
    pub job_timeout: Option<Duration>,
    pub events: EventBus,
}

impl WorkerContext {
    /// Retry policy bounded by the job's own attempt limit
    pub(crate) fn retry_policy_for(&self, max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            ..self.retry_policy.clone()
        }
    }
}

/// Bounded-concurrency job loop for one worker
pub struct JobProcessor {
    worker_id: WorkerId,
    ctx: Arc<WorkerContext>,
}

impl JobProcessor {
    pub fn new(worker_id: WorkerId, ctx: Arc<WorkerContext>) -> Self {
        Self { worker_id, ctx }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Run until `shutdown` fires, then drain in-flight jobs
    ///
    /// In-flight jobs live in a `JoinSet` owned by this future. If the
    /// worker is aborted, dropping the future aborts them too.
    pub async fn run(self, shutdown: CancellationToken) {
        let worker_id = self.worker_id;
        info!(%worker_id, concurrency = self.ctx.concurrency, "Job processor started");

        let slots = Arc::new(Semaphore::new(self.ctx.concurrency));
        let mut inflight = JoinSet::new();
        let mut poller = JobPoller::new(
            Arc::clone(&self.ctx.queue),
            self.ctx.queue_name.clone(),
            worker_id,
            self.ctx.poller.clone(),
        );

        loop {
            if shutdown.is_cancelled() {
                debug!(%worker_id, "Processor: shutdown requested");
                break;
            }

            let available = slots.available_permits();
            if available > 0 {
                match poller.poll(available).await {
                    Ok(jobs) => {
                        for job in jobs {
                            // Only this loop takes permits, so `available` are still free.
                            let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                                error!(%worker_id, "Job slot semaphore closed");
                                return;
                            };
                            let ctx = Arc::clone(&self.ctx);
                            inflight.spawn(async move {
                                execute(&ctx, job).await;
                                drop(permit);
                            });
                        }
                    }
                    Err(e) => {
                        error!(%worker_id, error = %e, "Poll failed");
                    }
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(%worker_id, "Processor: shutdown requested");
                    break;
                }
                Some(joined) = inflight.join_next(), if !inflight.is_empty() => {
                    log_join(worker_id, joined);
                }
                _ = poller.wait() => {}
            }
        }

        if !inflight.is_empty() {
            info!(%worker_id, in_flight = inflight.len(), "Draining in-flight jobs");
        }
        while let Some(joined) = inflight.join_next().await {
            log_join(worker_id, joined);
        }

        info!(%worker_id, "Job processor stopped");
    }
}

fn log_join(worker_id: WorkerId, joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(%worker_id, "Job task panicked outside the handler");
        }
    }
}

/// Run one claimed job and settle its accounting
async fn execute(ctx: &WorkerContext, job: ClaimedJob) {
    let job_id = job.id;
    let worker_id = job.assigned_worker;
    let attempt_count = job.attempt_count;
    let max_attempts = job.max_attempts;

    debug!(%job_id, %worker_id, attempt_count, "Running job");
    let outcome = run_handler(ctx, job).await;

    // Every finished attempt gives its load back first.
    release(ctx, worker_id, job_id);

    match outcome {
        Ok(_) => {
            if let Err(e) = ctx.queue.complete(job_id).await {
                error!(%job_id, %worker_id, error = %e, "Failed to mark job completed");
                return;
            }
            info!(%job_id, %worker_id, "Job completed");
            ctx.events
                .publish(PoolEvent::JobCompleted { job_id, worker_id });
        }
        Err(error) => {
            handle_failure(ctx, worker_id, job_id, attempt_count, max_attempts, error).await;
        }
    }
}

async fn run_handler(ctx: &WorkerContext, job: ClaimedJob) -> JobResult {
    let attempt = AssertUnwindSafe((ctx.handler)(job)).catch_unwind();

    let caught = match ctx.job_timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(caught) => caught,
            Err(_) => return Err(format!("job timed out after {}ms", limit.as_millis())),
        },
        None => attempt.await,
    };

    caught.unwrap_or_else(|panic| Err(format!("job handler panicked: {}", panic_message(&*panic))))
}

async fn handle_failure(
    ctx: &WorkerContext,
    worker_id: WorkerId,
    job_id: JobId,
    attempt_count: u32,
    max_attempts: u32,
    error: String,
) {
    match ctx.retry_policy_for(max_attempts).decide(attempt_count) {
        RetryDecision::Retry { next_attempt, delay } => {
            // The retry stays pinned to this worker and takes its load back
            // before it is pending again.
            let retaken = match ctx.registry.adjust(worker_id, 1) {
                Ok(_) => true,
                Err(e) => {
                    error!(%job_id, %worker_id, error = %e, "Failed to re-take load for retry");
                    false
                }
            };

            match ctx.queue.retry(job_id, &error, delay).await {
                Ok(attempt_count) => {
                    warn!(
                        %job_id,
                        %worker_id,
                        attempt_count,
                        next_attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Job failed, retrying"
                    );
                    ctx.events.publish(PoolEvent::JobRetrying {
                        job_id,
                        worker_id,
                        attempt_count,
                        error,
                    });
                }
                Err(e) => {
                    error!(%job_id, %worker_id, error = %e, "Failed to re-enqueue job, failing it");
                    if retaken {
                        release(ctx, worker_id, job_id);
                    }
                    fail_terminally(ctx, worker_id, job_id, attempt_count + 1, error).await;
                }
            }
        }
        RetryDecision::Exhausted => {
            fail_terminally(ctx, worker_id, job_id, attempt_count + 1, error).await;
        }
    }
}

async fn fail_terminally(
    ctx: &WorkerContext,
    worker_id: WorkerId,
    job_id: JobId,
    attempts: u32,
    last_error: String,
) {
    if let Err(e) = ctx.queue.fail(job_id, &last_error).await {
        error!(%job_id, %worker_id, error = %e, "Failed to mark job failed");
        return;
    }

    let failure = RetryExhausted {
        job_id,
        worker_id,
        attempts,
        last_error,
    };
    error!(%job_id, %worker_id, attempts, "{failure}");
    ctx.events.publish(PoolEvent::JobFailed(failure));
}

fn release(ctx: &WorkerContext, worker_id: WorkerId, job_id: JobId) {
    if let Err(e) = ctx.registry.adjust(worker_id, -1) {
        error!(%job_id, %worker_id, error = %e, "Failed to release job load");
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
