//! In-memory implementation of JobQueue

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::registry::WorkerId;

/// Internal job state
struct JobState {
    record: JobRecord,
    /// Enqueue order, used for FIFO claiming
    seq: u64,
    remove_on_complete: bool,
}

#[derive(Default)]
struct Jobs {
    by_id: HashMap<JobId, JobState>,
    next_seq: u64,
}

/// In-memory implementation of JobQueue
///
/// Stores all jobs in memory with the same semantics a persistent backend
/// must provide. `set_unavailable` makes enqueue, retry and reassign fail,
/// for exercising the compensation paths of their callers.
///
/// # Example
///
/// ```
/// use loadpool::InMemoryJobQueue;
///
/// let queue = InMemoryJobQueue::new();
/// assert_eq!(queue.len(), 0);
/// ```
#[derive(Default)]
pub struct InMemoryJobQueue {
    jobs: RwLock<Jobs>,
    unavailable: AtomicBool,
}

impl InMemoryJobQueue {
    /// Create a new in-memory queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Make enqueue, retry and reassign fail with `QueueError::Unavailable` (for testing)
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable("in-memory queue marked unavailable".into()));
        }
        Ok(())
    }

    /// Number of stored jobs, terminal ones included
    pub fn len(&self) -> usize {
        self.jobs.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of jobs in a given status
    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .by_id
            .values()
            .filter(|j| j.record.status == status)
            .count()
    }

    /// Number of jobs still counting toward some worker's load
    pub fn assigned_count(&self) -> usize {
        self.jobs
            .read()
            .by_id
            .values()
            .filter(|j| j.record.status.is_assigned())
            .count()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.jobs.write().by_id.clear();
    }
}

fn job_mut(jobs: &mut Jobs, job_id: JobId) -> Result<&mut JobState, QueueError> {
    jobs.by_id
        .get_mut(&job_id)
        .ok_or(QueueError::JobNotFound(job_id))
}

fn expect_status(
    job: &JobState,
    expected: JobStatus,
    action: &'static str,
) -> Result<(), QueueError> {
    if job.record.status != expected {
        return Err(QueueError::InvalidTransition {
            job_id: job.record.id,
            status: job.record.status,
            action,
        });
    }
    Ok(())
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, queue: &str, job: JobDefinition) -> Result<JobId, QueueError> {
        self.check_available()?;

        let job_id = Uuid::now_v7();
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        let seq = jobs.next_seq;
        jobs.next_seq += 1;
        jobs.by_id.insert(
            job_id,
            JobState {
                record: JobRecord {
                    id: job_id,
                    queue: queue.to_string(),
                    assigned_worker: job.assigned_worker,
                    payload: job.payload,
                    attempt_count: 0,
                    max_attempts: job.options.max_attempts,
                    status: JobStatus::Pending,
                    last_error: None,
                    enqueued_at: now,
                    available_at: now,
                },
                seq,
                remove_on_complete: job.options.remove_on_complete,
            },
        );
        Ok(job_id)
    }

    async fn claim(
        &self,
        queue: &str,
        worker_id: WorkerId,
        max_jobs: usize,
    ) -> Result<Vec<ClaimedJob>, QueueError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();

        let mut ready: Vec<(u64, JobId)> = jobs
            .by_id
            .values()
            .filter(|j| {
                j.record.status == JobStatus::Pending
                    && j.record.assigned_worker == worker_id
                    && j.record.queue == queue
                    && j.record.available_at <= now
            })
            .map(|j| (j.seq, j.record.id))
            .collect();
        ready.sort_unstable();
        ready.truncate(max_jobs);

        let mut claimed = Vec::with_capacity(ready.len());
        for (_, job_id) in ready {
            let job = job_mut(&mut jobs, job_id)?;
            job.record.status = JobStatus::Running;
            claimed.push(ClaimedJob {
                id: job_id,
                queue: job.record.queue.clone(),
                assigned_worker: job.record.assigned_worker,
                payload: job.record.payload.clone(),
                attempt_count: job.record.attempt_count,
                max_attempts: job.record.max_attempts,
            });
        }

        Ok(claimed)
    }

    async fn complete(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write();
        let job = job_mut(&mut jobs, job_id)?;
        expect_status(job, JobStatus::Running, "complete")?;

        if job.remove_on_complete {
            jobs.by_id.remove(&job_id);
        } else {
            job.record.status = JobStatus::Completed;
        }
        Ok(())
    }

    async fn retry(
        &self,
        job_id: JobId,
        error: &str,
        delay: Duration,
    ) -> Result<u32, QueueError> {
        self.check_available()?;
        let mut jobs = self.jobs.write();
        let job = job_mut(&mut jobs, job_id)?;
        expect_status(job, JobStatus::Running, "retry")?;

        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        job.record.status = JobStatus::Pending;
        job.record.attempt_count += 1;
        job.record.last_error = Some(error.to_string());
        job.record.available_at = Utc::now() + delay;
        Ok(job.record.attempt_count)
    }

    async fn fail(&self, job_id: JobId, error: &str) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write();
        let job = job_mut(&mut jobs, job_id)?;
        expect_status(job, JobStatus::Running, "fail")?;

        job.record.status = JobStatus::Failed;
        job.record.last_error = Some(error.to_string());
        Ok(())
    }

    async fn cancel(&self, job_id: JobId) -> Result<bool, QueueError> {
        let mut jobs = self.jobs.write();
        let job = job_mut(&mut jobs, job_id)?;
        if job.record.status != JobStatus::Pending {
            return Ok(false);
        }
        job.record.status = JobStatus::Cancelled;
        Ok(true)
    }

    async fn orphaned(&self, worker_id: WorkerId) -> Result<Vec<JobRecord>, QueueError> {
        let jobs = self.jobs.read();
        let mut orphans: Vec<&JobState> = jobs
            .by_id
            .values()
            .filter(|j| j.record.assigned_worker == worker_id && j.record.status.is_assigned())
            .collect();
        orphans.sort_unstable_by_key(|j| j.seq);
        Ok(orphans.into_iter().map(|j| j.record.clone()).collect())
    }

    async fn reassign(
        &self,
        job_id: JobId,
        worker_id: WorkerId,
        attempt_count: u32,
    ) -> Result<(), QueueError> {
        self.check_available()?;
        let mut jobs = self.jobs.write();
        let job = job_mut(&mut jobs, job_id)?;
        if job.record.status.is_terminal() {
            return Err(QueueError::InvalidTransition {
                job_id,
                status: job.record.status,
                action: "reassign",
            });
        }

        job.record.assigned_worker = worker_id;
        job.record.attempt_count = attempt_count;
        job.record.status = JobStatus::Pending;
        job.record.available_at = Utc::now();
        Ok(())
    }

    async fn get(&self, job_id: JobId) -> Result<Option<JobRecord>, QueueError> {
        Ok(self
            .jobs
            .read()
            .by_id
            .get(&job_id)
            .map(|j| j.record.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const QUEUE: &str = "taskQueue";

    fn definition(worker: u64) -> JobDefinition {
        JobDefinition {
            assigned_worker: WorkerId::new(worker),
            payload: json!({"n": worker}),
            options: JobOptions {
                max_attempts: 3,
                remove_on_complete: false,
            },
        }
    }

    #[tokio::test]
    async fn test_job_lifecycle() {
        let queue = InMemoryJobQueue::new();
        let job_id = queue.enqueue(QUEUE, definition(1)).await.unwrap();

        let record = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.attempt_count, 0);

        let claimed = queue.claim(QUEUE, WorkerId::new(1), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job_id);

        queue.complete(job_id).await.unwrap();
        let record = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_claim_only_returns_jobs_for_worker_in_order() {
        let queue = InMemoryJobQueue::new();
        let first = queue.enqueue(QUEUE, definition(1)).await.unwrap();
        queue.enqueue(QUEUE, definition(2)).await.unwrap();
        let third = queue.enqueue(QUEUE, definition(1)).await.unwrap();
        queue.enqueue("other", definition(1)).await.unwrap();

        let claimed = queue.claim(QUEUE, WorkerId::new(1), 10).await.unwrap();
        let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();

        assert_eq!(ids, vec![first, third]);
        assert!(queue.claim(QUEUE, WorkerId::new(1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_max_jobs() {
        let queue = InMemoryJobQueue::new();
        for _ in 0..5 {
            queue.enqueue(QUEUE, definition(1)).await.unwrap();
        }

        let claimed = queue.claim(QUEUE, WorkerId::new(1), 2).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert_eq!(queue.count(JobStatus::Pending), 3);
        assert_eq!(queue.count(JobStatus::Running), 2);
    }

    #[tokio::test]
    async fn test_remove_on_complete() {
        let queue = InMemoryJobQueue::new();
        let mut def = definition(1);
        def.options.remove_on_complete = true;
        let job_id = queue.enqueue(QUEUE, def).await.unwrap();

        queue.claim(QUEUE, WorkerId::new(1), 1).await.unwrap();
        queue.complete(job_id).await.unwrap();

        assert!(queue.get(job_id).await.unwrap().is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_retry_increments_attempts_and_delays() {
        let queue = InMemoryJobQueue::new();
        let job_id = queue.enqueue(QUEUE, definition(1)).await.unwrap();
        queue.claim(QUEUE, WorkerId::new(1), 1).await.unwrap();

        let attempts = queue
            .retry(job_id, "boom", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(attempts, 1);

        let record = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Pending);
        assert_eq!(record.last_error.as_deref(), Some("boom"));

        // Not yet available
        assert!(queue.claim(QUEUE, WorkerId::new(1), 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let queue = InMemoryJobQueue::new();
        let job_id = queue.enqueue(QUEUE, definition(1)).await.unwrap();

        let err = queue.complete(job_id).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                status: JobStatus::Pending,
                ..
            }
        ));
        assert!(matches!(
            queue.fail(Uuid::now_v7(), "x").await,
            Err(QueueError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let queue = InMemoryJobQueue::new();
        let pending = queue.enqueue(QUEUE, definition(1)).await.unwrap();
        let running = queue.enqueue(QUEUE, definition(2)).await.unwrap();
        queue.claim(QUEUE, WorkerId::new(2), 1).await.unwrap();

        assert!(queue.cancel(pending).await.unwrap());
        assert!(!queue.cancel(running).await.unwrap());
        assert!(!queue.cancel(pending).await.unwrap());

        let record = queue.get(pending).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_orphaned_and_reassign() {
        let queue = InMemoryJobQueue::new();
        let running = queue.enqueue(QUEUE, definition(1)).await.unwrap();
        queue.claim(QUEUE, WorkerId::new(1), 1).await.unwrap();
        let done = queue.enqueue(QUEUE, definition(1)).await.unwrap();
        queue.claim(QUEUE, WorkerId::new(1), 1).await.unwrap();
        queue.complete(done).await.unwrap();
        let pending = queue.enqueue(QUEUE, definition(1)).await.unwrap();
        queue.enqueue(QUEUE, definition(2)).await.unwrap();

        let orphans = queue.orphaned(WorkerId::new(1)).await.unwrap();
        let ids: Vec<_> = orphans.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![running, pending]);

        queue.reassign(running, WorkerId::new(2), 1).await.unwrap();
        let record = queue.get(running).await.unwrap().unwrap();
        assert_eq!(record.assigned_worker, WorkerId::new(2));
        assert_eq!(record.attempt_count, 1);
        assert_eq!(record.status, JobStatus::Pending);

        assert!(queue.reassign(done, WorkerId::new(2), 0).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_rejects_enqueue() {
        let queue = InMemoryJobQueue::new();
        queue.set_unavailable(true);

        assert!(matches!(
            queue.enqueue(QUEUE, definition(1)).await,
            Err(QueueError::Unavailable(_))
        ));

        queue.set_unavailable(false);
        assert!(queue.enqueue(QUEUE, definition(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unavailable_rejects_retry_and_reassign() {
        let queue = InMemoryJobQueue::new();
        let job_id = queue.enqueue(QUEUE, definition(1)).await.unwrap();
        queue.claim(QUEUE, WorkerId::new(1), 1).await.unwrap();
        queue.set_unavailable(true);

        assert!(matches!(
            queue.retry(job_id, "boom", Duration::ZERO).await,
            Err(QueueError::Unavailable(_))
        ));
        assert!(matches!(
            queue.reassign(job_id, WorkerId::new(2), 1).await,
            Err(QueueError::Unavailable(_))
        ));

        // Untouched by the failed calls; terminal transitions still go through
        let record = queue.get(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.assigned_worker, WorkerId::new(1));
        queue.fail(job_id, "boom").await.unwrap();
    }
}
