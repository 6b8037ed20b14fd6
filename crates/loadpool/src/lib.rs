//! # Loadpool
//!
//! A supervised worker pool that assigns every submitted job to the
//! least-loaded worker and keeps the pool at full strength when workers die.
//!
//! ## Features
//!
//! - **Authoritative load registry**: one lock-protected owner of per-worker load, injected everywhere
//! - **Deterministic least-loaded selection**: ties resolve by ascending worker id
//! - **Self-healing pool**: dead workers are replaced atomically and their orphaned jobs reaped
//! - **Bounded retries**: failed jobs are retried up to `max_attempts`, then reported as terminal
//! - **Pluggable durable queue**: [`JobQueue`] trait with an in-memory reference backend
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Dispatcher                              │
//! │  (assign_least + enqueue, compensates on enqueue failure)   │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                   ▲
//!            ▼                                   │ adjust(±1)
//! ┌───────────────────────┐          ┌─────────────────────────┐
//! │       JobQueue         │◄────────│      LoadRegistry        │
//! │ (pending/running jobs) │         │ (worker id → load)       │
//! └───────────────────────┘          └─────────────────────────┘
//!            │                                   ▲
//!            ▼                                   │ replace / reap
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Supervisor                              │
//! │  [JobProcessor 1] [JobProcessor 2] ... [JobProcessor N]     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use loadpool::prelude::*;
//!
//! let queue = Arc::new(InMemoryJobQueue::new());
//! let config = WorkerPoolConfig::default().with_worker_count(4);
//! let pool = WorkerPool::new(queue, config, simulated_work(Duration::from_secs(12)))?;
//!
//! pool.start().await?;
//! let receipt = pool.submit(json!({"task": "resize"})).await?;
//! println!("job {} went to {}", receipt.job_id, receipt.assigned_worker);
//!
//! pool.shutdown().await?;
//! ```

pub mod dispatch;
pub mod events;
pub mod queue;
pub mod registry;
pub mod reliability;
pub mod worker;

mod duration_millis;

/// Prelude for common imports
pub mod prelude {
    pub use crate::dispatch::{DispatchError, Dispatcher, SubmitReceipt};
    pub use crate::events::{EventBus, PoolEvent, RetryExhausted, WorkerExit};
    pub use crate::queue::{
        ClaimedJob, InMemoryJobQueue, JobDefinition, JobId, JobOptions, JobQueue, JobRecord,
        JobStatus, QueueError,
    };
    pub use crate::registry::{LoadRegistry, RegistryError, WorkerId, WorkerRecord};
    pub use crate::reliability::{RestartBudget, RetryDecision, RetryPolicy};
    pub use crate::worker::{
        handler_fn, simulated_work, JobHandler, JobResult, PollerConfig, Supervisor,
        SupervisorError, WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus,
    };
}

// Re-export key types at crate root
pub use dispatch::{DispatchError, Dispatcher, SubmitReceipt};
pub use events::{EventBus, PoolEvent, RetryExhausted, WorkerExit};
pub use queue::{
    ClaimedJob, InMemoryJobQueue, JobDefinition, JobId, JobOptions, JobQueue, JobRecord, JobStatus,
    QueueError,
};
pub use registry::{LoadRegistry, RegistryError, WorkerId, WorkerRecord};
pub use reliability::{RestartBudget, RetryDecision, RetryPolicy};
pub use worker::{
    handler_fn, simulated_work, JobHandler, JobResult, PollerConfig, Supervisor, SupervisorError,
    WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus,
};
