//! Worker pool facade
//!
//! Wires one registry, one queue, the dispatcher and the supervisor
//! together and owns the supervision task.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::handler::JobHandler;
use super::poller::PollerConfig;
use super::processor::WorkerContext;
use super::supervisor::{Supervisor, SupervisorError};
use crate::dispatch::{DispatchError, Dispatcher, SubmitReceipt};
use crate::events::{EventBus, PoolEvent};
use crate::queue::{JobId, JobOptions, JobQueue, JobRecord, QueueError};
use crate::registry::{LoadRegistry, WorkerId, WorkerRecord};
use crate::reliability::{RestartBudget, RetryPolicy};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of workers kept alive
    pub worker_count: usize,

    /// Queue that jobs are enqueued on and claimed from
    pub queue_name: String,

    /// Maximum concurrent jobs per worker
    pub concurrency: usize,

    /// Retry policy; `max_attempts` is stamped on every submitted job
    pub retry_policy: RetryPolicy,

    /// Poller configuration
    pub poller: PollerConfig,

    /// Per-attempt execution limit
    #[serde(default, with = "crate::duration_millis::option")]
    pub job_timeout: Option<Duration>,

    /// Limit on worker replacements
    pub restart_budget: RestartBudget,

    /// Drop completed jobs from the queue
    pub remove_on_complete: bool,

    /// Graceful shutdown timeout
    #[serde(with = "crate::duration_millis")]
    pub shutdown_timeout: Duration,

    /// Event bus capacity
    pub event_capacity: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_name: "taskQueue".to_string(),
            concurrency: 8,
            retry_policy: RetryPolicy::default(),
            poller: PollerConfig::default(),
            job_timeout: None,
            restart_budget: RestartBudget::default(),
            remove_on_complete: true,
            shutdown_timeout: Duration::from_secs(30),
            event_capacity: 1024,
        }
    }
}

impl WorkerPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }

    /// Set maximum concurrency per worker
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Set poller configuration
    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_restart_budget(mut self, budget: RestartBudget) -> Self {
        self.restart_budget = budget;
        self
    }

    pub fn with_remove_on_complete(mut self, remove: bool) -> Self {
        self.remove_on_complete = remove;
        self
    }

    /// Set shutdown timeout
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), WorkerPoolError> {
        if self.worker_count == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "worker_count must be at least 1".into(),
            ));
        }
        if self.concurrency == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "concurrency must be at least 1".into(),
            ));
        }
        if self.retry_policy.max_attempts == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "max_attempts must be at least 1".into(),
            ));
        }
        if self.concurrency > Semaphore::MAX_PERMITS {
            return Err(WorkerPoolError::InvalidConfig(format!(
                "concurrency must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.queue_name.trim().is_empty() {
            return Err(WorkerPoolError::InvalidConfig(
                "queue_name must not be empty".into(),
            ));
        }

        let poller = &self.poller;
        if poller.batch_size == 0 {
            return Err(WorkerPoolError::InvalidConfig(
                "poller.batch_size must be at least 1".into(),
            ));
        }
        if poller.min_interval.is_zero() {
            return Err(WorkerPoolError::InvalidConfig(
                "poller.min_interval must be positive".into(),
            ));
        }
        if poller.min_interval > poller.max_interval {
            return Err(WorkerPoolError::InvalidConfig(
                "poller.min_interval must not exceed poller.max_interval".into(),
            ));
        }
        if poller.backoff_multiplier.is_nan() || poller.backoff_multiplier < 1.0 {
            return Err(WorkerPoolError::InvalidConfig(
                "poller.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    fn job_options(&self) -> JobOptions {
        JobOptions {
            max_attempts: self.retry_policy.max_attempts,
            remove_on_complete: self.remove_on_complete,
        }
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPoolStatus {
    /// Created, not started
    Idle,
    /// Workers are supervised
    Running,
    /// Shutdown in progress, in-flight jobs draining
    Draining,
    /// Shut down
    Stopped,
    /// The supervisor gave up; workers may still run but are not replaced
    Failed,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("invalid worker pool configuration: {0}")]
    InvalidConfig(String),

    /// Worker pool already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Worker pool not running
    #[error("worker pool is not running")]
    NotRunning,

    /// Pools are single-use
    #[error("worker pool has already stopped")]
    Terminated,

    #[error("supervisor error: {0}")]
    Supervisor(#[from] SupervisorError),

    /// The supervision task panicked
    #[error("supervisor task panicked: {0}")]
    SupervisorPanicked(String),

    /// Shutdown timeout
    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

type SuperviseHandle = JoinHandle<Result<(), SupervisorError>>;

/// Self-healing, load-balanced worker pool
///
/// # Example
///
/// ```ignore
/// let pool = WorkerPool::new(queue, WorkerPoolConfig::default(), handler)?;
/// pool.start().await?;
///
/// let receipt = pool.submit(json!({"task": 1})).await?;
///
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool {
    config: WorkerPoolConfig,
    registry: Arc<LoadRegistry>,
    queue: Arc<dyn JobQueue>,
    dispatcher: Dispatcher,
    supervisor: Arc<Supervisor>,
    events: EventBus,
    status: Arc<RwLock<WorkerPoolStatus>>,
    supervise: Mutex<Option<SuperviseHandle>>,
}

impl WorkerPool {
    /// Create a pool around `queue`; nothing runs until [`start`](Self::start)
    pub fn new(
        queue: Arc<dyn JobQueue>,
        config: WorkerPoolConfig,
        handler: JobHandler,
    ) -> Result<Self, WorkerPoolError> {
        config.validate()?;

        let registry = Arc::new(LoadRegistry::new());
        let events = EventBus::new(config.event_capacity);

        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            config.queue_name.clone(),
            config.job_options(),
            events.clone(),
        );

        let ctx = Arc::new(WorkerContext {
            registry: Arc::clone(&registry),
            queue: Arc::clone(&queue),
            queue_name: config.queue_name.clone(),
            handler,
            retry_policy: config.retry_policy.clone(),
            concurrency: config.concurrency,
            poller: config.poller.clone(),
            job_timeout: config.job_timeout,
            events: events.clone(),
        });
        let supervisor = Arc::new(Supervisor::new(
            ctx,
            config.worker_count,
            config.restart_budget,
        ));

        Ok(Self {
            config,
            registry,
            queue,
            dispatcher,
            supervisor,
            events,
            status: Arc::new(RwLock::new(WorkerPoolStatus::Idle)),
            supervise: Mutex::new(None),
        })
    }

    /// Spawn the workers and start supervising them
    #[instrument(skip(self), fields(worker_count = self.config.worker_count))]
    pub async fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            match *status {
                WorkerPoolStatus::Idle => {}
                WorkerPoolStatus::Running | WorkerPoolStatus::Draining => {
                    return Err(WorkerPoolError::AlreadyRunning)
                }
                WorkerPoolStatus::Stopped | WorkerPoolStatus::Failed => {
                    return Err(WorkerPoolError::Terminated)
                }
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            queue = %self.config.queue_name,
            concurrency = self.config.concurrency,
            max_attempts = self.config.retry_policy.max_attempts,
            "Starting worker pool"
        );

        if let Err(e) = self.supervisor.start() {
            error!(error = %e, "Failed to start workers");
            *self.status.write() = WorkerPoolStatus::Failed;
            self.events.publish(PoolEvent::SupervisorFailed {
                error: e.to_string(),
            });
            return Err(e.into());
        }

        let supervisor = Arc::clone(&self.supervisor);
        let status = Arc::clone(&self.status);
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            let result = supervisor.run().await;
            if let Err(e) = &result {
                error!(error = %e, "Supervisor failed, pool is no longer self-healing");
                *status.write() = WorkerPoolStatus::Failed;
                events.publish(PoolEvent::SupervisorFailed {
                    error: e.to_string(),
                });
            }
            result
        });
        *self.supervise.lock().await = Some(handle);

        Ok(())
    }

    /// Wait for the supervisor to stop
    ///
    /// Returns the fatal supervisor error if supervision failed. Cancel-safe.
    pub async fn wait(&self) -> Result<(), WorkerPoolError> {
        let mut supervise = self.supervise.lock().await;
        let Some(handle) = supervise.as_mut() else {
            return Err(WorkerPoolError::NotRunning);
        };
        let joined = handle.await;
        supervise.take();

        match joined {
            Ok(result) => result.map_err(WorkerPoolError::from),
            Err(e) if e.is_panic() => Err(WorkerPoolError::SupervisorPanicked(
                super::processor::panic_message(&*e.into_panic()),
            )),
            Err(e) => Err(WorkerPoolError::SupervisorPanicked(e.to_string())),
        }
    }

    /// Drain in-flight jobs and stop all workers
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            match *status {
                WorkerPoolStatus::Idle | WorkerPoolStatus::Stopped => {
                    *status = WorkerPoolStatus::Stopped;
                    return Ok(());
                }
                WorkerPoolStatus::Draining => return Ok(()),
                WorkerPoolStatus::Running | WorkerPoolStatus::Failed => {
                    *status = WorkerPoolStatus::Draining;
                }
            }
        }

        info!("Initiating graceful shutdown");
        self.supervisor.cancel();

        if let Some(handle) = self.supervise.lock().await.take() {
            // Errors were already reported by the supervision task
            let _ = handle.await;
        }

        let drained = self
            .supervisor
            .stop_workers(self.config.shutdown_timeout)
            .await;

        *self.status.write() = WorkerPoolStatus::Stopped;

        if !drained {
            warn!("Shutdown timeout reached, in-flight jobs were aborted");
            return Err(WorkerPoolError::ShutdownTimeout);
        }

        info!("Worker pool stopped");
        Ok(())
    }

    /// Submit a payload to the least-loaded worker
    ///
    /// Only a running pool takes work. While idle, draining, stopped or
    /// failed it answers `NoWorkersAvailable`.
    pub async fn submit(&self, payload: serde_json::Value) -> Result<SubmitReceipt, DispatchError> {
        let status = self.status();
        if status != WorkerPoolStatus::Running {
            debug!(?status, "Rejecting submission, pool is not running");
            return Err(DispatchError::NoWorkersAvailable);
        }
        self.dispatcher.submit(payload).await
    }

    /// Cancel a pending job
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, DispatchError> {
        self.dispatcher.cancel(job_id).await
    }

    pub async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, QueueError> {
        self.queue.get(job_id).await
    }

    /// Abort a worker to simulate a crash
    pub fn kill_worker(&self, worker_id: WorkerId) -> Result<(), SupervisorError> {
        self.supervisor.kill(worker_id)
    }

    pub fn live_workers(&self) -> Vec<WorkerId> {
        self.supervisor.live_workers()
    }

    /// Per-worker load, ascending by worker id
    pub fn loads(&self) -> Vec<WorkerRecord> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &Arc<LoadRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }
}
