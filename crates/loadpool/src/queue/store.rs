//! JobQueue trait definition

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::registry::WorkerId;

/// Job identifier (UUID v7, time-ordered)
pub type JobId = Uuid;

/// Error type for queue operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Backend unreachable or refused the operation
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// Operation not valid for the job's current status
    #[error("cannot {action} job {job_id} in status {status}")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        action: &'static str,
    },
}

/// Job status in the queue
///
/// A `Pending` job is already assigned: it carries the worker it is tagged
/// for and counts toward that worker's load until it reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be pulled by its assigned worker
    Pending,

    /// Being executed by its assigned worker
    Running,

    /// Finished successfully
    Completed,

    /// Exhausted its retry budget
    Failed,

    /// Cancelled before it was pulled
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether the job still counts toward its worker's load
    pub fn is_assigned(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-job enqueue options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Total executions allowed, including the first
    pub max_attempts: u32,

    /// Drop the record once the job completes
    pub remove_on_complete: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            remove_on_complete: true,
        }
    }
}

/// Definition of a job to be enqueued
#[derive(Debug, Clone)]
pub struct JobDefinition {
    pub assigned_worker: WorkerId,
    pub payload: serde_json::Value,
    pub options: JobOptions,
}

/// A job that has been pulled by its worker
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: JobId,
    pub queue: String,
    pub assigned_worker: WorkerId,
    pub payload: serde_json::Value,
    /// Failed attempts so far (0 on the first execution)
    pub attempt_count: u32,
    pub max_attempts: u32,
}

/// Full job state as stored by the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub assigned_worker: WorkerId,
    pub payload: serde_json::Value,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}

/// Queue that hands jobs from the dispatcher to workers
///
/// Implementations must be thread-safe and support concurrent access.
/// Jobs are always tagged with the worker they are assigned to; `claim`
/// only returns jobs tagged for the claiming worker, in enqueue order.
#[async_trait]
pub trait JobQueue: Send + Sync + 'static {
    /// Enqueue a job as `Pending`
    async fn enqueue(&self, queue: &str, job: JobDefinition) -> Result<JobId, QueueError>;

    /// Move up to `max_jobs` available `Pending` jobs tagged for `worker_id` to `Running`
    async fn claim(
        &self,
        queue: &str,
        worker_id: WorkerId,
        max_jobs: usize,
    ) -> Result<Vec<ClaimedJob>, QueueError>;

    /// `Running` → `Completed`
    async fn complete(&self, job_id: JobId) -> Result<(), QueueError>;

    /// `Running` → `Pending` with the attempt count incremented
    ///
    /// The job becomes claimable again after `delay`. Returns the new attempt count.
    async fn retry(&self, job_id: JobId, error: &str, delay: Duration)
        -> Result<u32, QueueError>;

    /// `Running` → `Failed` (terminal)
    async fn fail(&self, job_id: JobId, error: &str) -> Result<(), QueueError>;

    /// `Pending` → `Cancelled`
    ///
    /// Returns `false` when the job is no longer pending.
    async fn cancel(&self, job_id: JobId) -> Result<bool, QueueError>;

    /// Non-terminal jobs still tagged for `worker_id`
    async fn orphaned(&self, worker_id: WorkerId) -> Result<Vec<JobRecord>, QueueError>;

    /// Retag a non-terminal job to another worker as `Pending`
    async fn reassign(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        attempt_count: u32,
    ) -> Result<(), QueueError>;

    /// Look up a job
    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, QueueError>;
}
