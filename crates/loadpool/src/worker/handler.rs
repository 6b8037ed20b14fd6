//! Job handler types

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;

use crate::queue::ClaimedJob;

/// Job execution result
pub type JobResult = Result<serde_json::Value, String>;

/// Job handler function type
pub type JobHandler = Arc<dyn Fn(ClaimedJob) -> BoxFuture<'static, JobResult> + Send + Sync>;

/// Wrap an async closure as a [`JobHandler`]
pub fn handler_fn<F, Fut>(handler: F) -> JobHandler
where
    F: Fn(ClaimedJob) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    Arc::new(move |job| Box::pin(handler(job)))
}

/// Handler that sleeps for `duration` and succeeds
pub fn simulated_work(duration: Duration) -> JobHandler {
    handler_fn(move |job| async move {
        tracing::debug!(job_id = %job.id, worker_id = %job.assigned_worker, "Processing job");
        tokio::time::sleep(duration).await;
        Ok(json!({
            "jobId": job.id,
            "workerId": job.assigned_worker,
        }))
    })
}
