//! Job dispatch
//!
//! The dispatcher is the only place load is incremented for new work:
//! it assigns the least-loaded worker, then enqueues the job tagged with it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument, warn};

use crate::events::{EventBus, PoolEvent};
use crate::queue::{JobDefinition, JobId, JobOptions, JobQueue, QueueError};
use crate::registry::{LoadRegistry, RegistryError, WorkerId};

/// Result of a successful submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub assigned_worker: WorkerId,
}

/// Dispatch errors
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The pool has no registered workers
    #[error("no workers available")]
    NoWorkersAvailable,

    /// The queue rejected the job; the load increment was rolled back
    #[error("failed to enqueue job: {0}")]
    EnqueueFailed(#[source] QueueError),

    /// Registry accounting defect
    #[error("registry error: {0}")]
    Registry(RegistryError),

    /// Queue error outside of enqueue
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

impl From<RegistryError> for DispatchError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NoWorkersAvailable => Self::NoWorkersAvailable,
            other => Self::Registry(other),
        }
    }
}

/// Assigns submitted work to workers
///
/// Cheap to clone; all clones share the same registry and queue.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<LoadRegistry>,
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    options: JobOptions,
    events: EventBus,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<LoadRegistry>,
        queue: Arc<dyn JobQueue>,
        queue_name: impl Into<String>,
        options: JobOptions,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            queue,
            queue_name: queue_name.into(),
            options,
            events,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Assign a payload to the least-loaded worker and enqueue it
    #[instrument(skip(self, payload), fields(queue = %self.queue_name))]
    pub async fn submit(&self, payload: serde_json::Value) -> Result<SubmitReceipt, DispatchError> {
        let _membership = self.registry.membership().await;

        let worker_id = self.registry.assign_least()?;

        let definition = JobDefinition {
            assigned_worker: worker_id,
            payload,
            options: self.options,
        };

        let job_id = match self.queue.enqueue(&self.queue_name, definition).await {
            Ok(job_id) => job_id,
            Err(e) => {
                warn!(%worker_id, error = %e, "Enqueue failed, rolling back load");
                if let Err(rollback) = self.registry.adjust(worker_id, -1) {
                    error!(%worker_id, error = %rollback, "Failed to roll back load after enqueue failure");
                }
                return Err(DispatchError::EnqueueFailed(e));
            }
        };

        debug!(%job_id, %worker_id, "Job dispatched");
        self.events.publish(PoolEvent::JobSubmitted { job_id, worker_id });

        Ok(SubmitReceipt {
            job_id,
            assigned_worker: worker_id,
        })
    }

    /// Cancel a job that has not been pulled yet
    ///
    /// Returns `false` if the job is already running or finished.
    #[instrument(skip(self))]
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, DispatchError> {
        let _membership = self.registry.membership().await;

        let record = self
            .queue
            .get(job_id)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;

        if !self.queue.cancel(job_id).await? {
            debug!(%job_id, status = %record.status, "Job no longer pending, not cancelled");
            return Ok(false);
        }

        // Tag cannot change while membership is held, so the record's worker is current.
        let worker_id = record.assigned_worker;
        self.registry.adjust(worker_id, -1).map_err(|e| {
            error!(%job_id, %worker_id, error = %e, "Load release failed for cancelled job");
            DispatchError::Registry(e)
        })?;

        debug!(%job_id, %worker_id, "Job cancelled");
        self.events.publish(PoolEvent::JobCancelled { job_id, worker_id });
        Ok(true)
    }
}
