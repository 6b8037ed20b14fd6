//! Pool events
//!
//! [`EventBus`] is a thin wrapper around [`tokio::sync::broadcast`]. The
//! dispatcher, processors and supervisor publish onto it; it is also the
//! failure-notification channel for jobs that exhaust their retries.
//!
//! Publishing never blocks. Events are dropped when nobody is subscribed,
//! and slow receivers observe `RecvError::Lagged`.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::queue::JobId;
use crate::registry::WorkerId;

/// Terminal job failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("job {job_id} failed after {attempts} attempts on {worker_id}: {last_error}")]
pub struct RetryExhausted {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    /// Executions made, including the last one
    pub attempts: u32,
    pub last_error: String,
}

/// How a worker task ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum WorkerExit {
    /// The processor loop returned
    Returned,
    /// The processor loop panicked
    Panicked(String),
    /// The task was aborted (killed)
    Aborted,
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Returned => write!(f, "returned"),
            Self::Panicked(msg) => write!(f, "panicked: {msg}"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Events published by the pool
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PoolEvent {
    // =========================================================================
    // Worker Lifecycle Events
    // =========================================================================
    WorkerStarted {
        worker_id: WorkerId,
    },

    WorkerExited {
        worker_id: WorkerId,
        exit: WorkerExit,
    },

    /// A dead worker was swapped out and its orphaned jobs re-homed
    WorkerReplaced {
        dead: WorkerId,
        replacement: WorkerId,
        orphaned_jobs: usize,
    },

    /// The supervisor gave up; the pool is no longer self-healing
    SupervisorFailed {
        error: String,
    },

    // =========================================================================
    // Job Lifecycle Events
    // =========================================================================
    JobSubmitted {
        job_id: JobId,
        worker_id: WorkerId,
    },

    JobCompleted {
        job_id: JobId,
        worker_id: WorkerId,
    },

    /// A failed attempt was re-enqueued
    JobRetrying {
        job_id: JobId,
        worker_id: WorkerId,
        attempt_count: u32,
        error: String,
    },

    /// Terminal failure
    JobFailed(RetryExhausted),

    JobCancelled {
        job_id: JobId,
        worker_id: WorkerId,
    },

    /// An orphaned job was moved off a dead worker
    JobReassigned {
        job_id: JobId,
        from: WorkerId,
        to: WorkerId,
        attempt_count: u32,
    },
}

impl PoolEvent {
    /// Job this event concerns, if any
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::JobSubmitted { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobRetrying { job_id, .. }
            | Self::JobCancelled { job_id, .. }
            | Self::JobReassigned { job_id, .. } => Some(*job_id),
            Self::JobFailed(failure) => Some(failure.job_id),
            _ => None,
        }
    }
}

/// Broadcast channel for pool events
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: broadcast::Sender<PoolEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus {
    /// Create a bus; capacity is clamped to at least 1
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to all current subscribers
    pub fn publish(&self, event: PoolEvent) {
        let _ = self.tx.send(event);
    }

    /// New receiver for events sent after this call
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new(4);
        bus.publish(PoolEvent::WorkerStarted {
            worker_id: WorkerId::new(1),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let job_id = Uuid::now_v7();

        bus.publish(PoolEvent::JobCompleted {
            job_id,
            worker_id: WorkerId::new(2),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.job_id(), Some(job_id));
    }

    #[test]
    fn test_event_serialization() {
        let event = PoolEvent::WorkerExited {
            worker_id: WorkerId::new(3),
            exit: WorkerExit::Aborted,
        };
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["type"], "worker_exited");
        assert_eq!(json["worker_id"], 3);
        assert_eq!(json["exit"]["kind"], "aborted");
    }

    #[test]
    fn test_retry_exhausted_display() {
        let failure = RetryExhausted {
            job_id: Uuid::nil(),
            worker_id: WorkerId::new(1),
            attempts: 3,
            last_error: "boom".into(),
        };
        assert!(failure.to_string().contains("after 3 attempts on worker-1: boom"));
    }
}
