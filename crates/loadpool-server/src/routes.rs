// Job submission and pool inspection HTTP routes

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use loadpool::{DispatchError, JobRecord, JobStatus, WorkerId, WorkerPool, WorkerPoolStatus};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// App state for pool routes
#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<WorkerPool>,
}

impl AppState {
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool }
    }
}

/// Create pool routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/enqueue-task", post(enqueue_task))
        .route("/health", get(health))
        .route("/workers", get(list_workers))
        .route("/jobs/:job_id", get(get_job).delete(cancel_job))
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueResponse {
    pub message: &'static str,
    pub job_id: Uuid,
    pub assigned_worker: WorkerId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub pool_status: WorkerPoolStatus,
    pub live_workers: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerLoad {
    pub worker_id: WorkerId,
    pub active_job_count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkersResponse {
    pub workers: Vec<WorkerLoad>,
    pub total_load: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub job_id: Uuid,
    pub queue: String,
    pub assigned_worker: WorkerId,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
}

impl From<JobRecord> for JobResponse {
    fn from(record: JobRecord) -> Self {
        Self {
            job_id: record.id,
            queue: record.queue,
            assigned_worker: record.assigned_worker,
            status: record.status,
            attempt_count: record.attempt_count,
            max_attempts: record.max_attempts,
            last_error: record.last_error,
            payload: record.payload,
            enqueued_at: record.enqueued_at,
            available_at: record.available_at,
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// POST /enqueue-task - Submit a task to the least-loaded worker
///
/// The body is an optional JSON payload; an empty body submits `null`.
pub async fn enqueue_task(State(state): State<AppState>, body: Bytes) -> Response {
    let payload = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice(&body) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::debug!(error = %e, "Rejected task payload");
                return error_response(StatusCode::BAD_REQUEST, "Invalid JSON payload");
            }
        }
    };

    match state.pool.submit(payload).await {
        Ok(receipt) => {
            tracing::info!(
                job_id = %receipt.job_id,
                worker_id = %receipt.assigned_worker,
                "Task added to the queue"
            );
            Json(EnqueueResponse {
                message: "Task has been added to the queue",
                job_id: receipt.job_id,
                assigned_worker: receipt.assigned_worker,
            })
            .into_response()
        }
        Err(DispatchError::NoWorkersAvailable) => {
            tracing::warn!("Task rejected: no workers available");
            error_response(StatusCode::SERVICE_UNAVAILABLE, "No workers available")
        }
        Err(e) => {
            tracing::error!("Failed to add task to the queue: {}", e);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to add task to the queue",
            )
        }
    }
}

/// GET /health - Pool health
///
/// Returns 503 once the supervisor has failed or the pool has stopped.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let pool_status = state.pool.status();
    let (code, status) = match pool_status {
        WorkerPoolStatus::Running => (StatusCode::OK, "ok"),
        _ => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            pool_status,
            live_workers: state.pool.live_workers().len(),
        }),
    )
}

/// GET /workers - Per-worker load snapshot
pub async fn list_workers(State(state): State<AppState>) -> Json<WorkersResponse> {
    let workers: Vec<WorkerLoad> = state
        .pool
        .loads()
        .into_iter()
        .map(|r| WorkerLoad {
            worker_id: r.worker_id,
            active_job_count: r.active_job_count,
        })
        .collect();
    let total_load = workers.iter().map(|w| w.active_job_count).sum();

    Json(WorkersResponse {
        workers,
        total_load,
    })
}

/// GET /jobs/:job_id - Job state
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<JobResponse>, StatusCode> {
    let record = state.pool.get_job(job_id).await.map_err(|e| {
        tracing::error!("Failed to get job: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    record
        .map(|r| Json(r.into()))
        .ok_or(StatusCode::NOT_FOUND)
}

/// DELETE /jobs/:job_id - Cancel a pending job
///
/// 204 when cancelled, 409 when the job already started or finished.
pub async fn cancel_job(State(state): State<AppState>, Path(job_id): Path<Uuid>) -> StatusCode {
    match state.pool.cancel(job_id).await {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::CONFLICT,
        Err(DispatchError::Queue(loadpool::QueueError::JobNotFound(_))) => StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!("Failed to cancel job: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use loadpool::{
        handler_fn, InMemoryJobQueue, PollerConfig, WorkerPoolConfig,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    /// Pool whose jobs never finish, so loads stay observable
    async fn app(started: bool) -> (Router, Arc<WorkerPool>, Arc<InMemoryJobQueue>) {
        let queue = Arc::new(InMemoryJobQueue::new());
        let config = WorkerPoolConfig::default()
            .with_worker_count(2)
            .with_concurrency(1)
            .with_poller(PollerConfig::new().with_min_interval(Duration::from_millis(5)))
            .with_remove_on_complete(false)
            .with_shutdown_timeout(Duration::from_millis(50));
        let handler = handler_fn(|_| async {
            std::future::pending::<()>().await;
            Ok(Value::Null)
        });
        let pool = Arc::new(WorkerPool::new(queue.clone(), config, handler).unwrap());
        if started {
            pool.start().await.unwrap();
        }
        (routes(AppState::new(pool.clone())), pool, queue)
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    fn enqueue(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/enqueue-task")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_task() {
        let (app, pool, _queue) = app(true).await;

        let (status, body) = send(&app, enqueue(r#"{"task":"resize"}"#)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Task has been added to the queue");
        assert_eq!(body["assignedWorker"], 1);
        let job_id: Uuid = body["jobId"].as_str().unwrap().parse().unwrap();
        let record = pool.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(record.payload, json!({"task": "resize"}));

        // Second task goes to the other, less loaded worker
        let (_, body) = send(&app, enqueue("")).await;
        assert_eq!(body["assignedWorker"], 2);

        pool.shutdown().await.ok();
    }

    #[tokio::test]
    async fn test_enqueue_invalid_json() {
        let (app, pool, _queue) = app(true).await;

        let (status, body) = send(&app, enqueue("{not json")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
        assert_eq!(pool.registry().total_load(), 0);

        pool.shutdown().await.ok();
    }

    #[tokio::test]
    async fn test_enqueue_without_workers() {
        let (app, _pool, _queue) = app(false).await;

        let (status, body) = send(&app, enqueue("{}")).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "No workers available");
    }

    #[tokio::test]
    async fn test_enqueue_queue_failure() {
        let (app, pool, queue) = app(true).await;
        queue.set_unavailable(true);

        let (status, body) = send(&app, enqueue("{}")).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to add task to the queue");
        assert_eq!(pool.registry().total_load(), 0);

        pool.shutdown().await.ok();
    }

    #[tokio::test]
    async fn test_health_and_workers() {
        let (app, pool, _queue) = app(true).await;
        send(&app, enqueue("{}")).await;

        let get = |uri: &'static str| Request::builder().uri(uri).body(Body::empty()).unwrap();

        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["poolStatus"], "running");
        assert_eq!(body["liveWorkers"], 2);

        let (status, body) = send(&app, get("/workers")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["workers"],
            json!([
                {"workerId": 1, "activeJobCount": 1},
                {"workerId": 2, "activeJobCount": 0},
            ])
        );
        assert_eq!(body["totalLoad"], 1);

        pool.shutdown().await.ok();
        let (status, body) = send(&app, get("/health")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["poolStatus"], "stopped");
    }

    #[tokio::test]
    async fn test_get_and_cancel_job() {
        let (app, pool, _queue) = app(false).await;
        // Not started: register a worker by hand and dispatch directly so
        // the job stays pending
        pool.registry().register(WorkerId::new(1)).unwrap();
        let receipt = pool.dispatcher().submit(json!({"n": 1})).await.unwrap();
        let uri = format!("/jobs/{}", receipt.job_id);

        let (status, body) = send(
            &app,
            Request::builder().uri(&uri).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["assignedWorker"], 1);
        assert_eq!(body["attemptCount"], 0);

        let delete = || {
            Request::builder()
                .method("DELETE")
                .uri(&uri)
                .body(Body::empty())
                .unwrap()
        };
        assert_eq!(send(&app, delete()).await.0, StatusCode::NO_CONTENT);
        assert_eq!(send(&app, delete()).await.0, StatusCode::CONFLICT);
        assert_eq!(pool.registry().total_load(), 0);

        let missing = format!("/jobs/{}", Uuid::now_v7());
        let (status, _) = send(
            &app,
            Request::builder().uri(&missing).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
