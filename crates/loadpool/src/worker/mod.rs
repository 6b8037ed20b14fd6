//! Supervised workers
//!
//! This module provides:
//! - [`WorkerPool`] - Facade that wires registry, dispatcher and supervisor together
//! - [`Supervisor`] - Keeps `worker_count` workers alive and reaps orphaned jobs
//! - [`JobProcessor`] - Per-worker bounded-concurrency job loop
//! - [`JobPoller`] - Claims jobs with exponential backoff when idle
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Supervisor                             │
//! │  exit events ──► replace(dead → new) ──► reap orphans        │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │  Worker N: JobProcessor                             │    │
//! │  │  JobPoller ──► Semaphore-limited JoinSet            │    │
//! │  │  [Job 1] [Job 2] ... [Job concurrency]              │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use loadpool::worker::{handler_fn, WorkerPool, WorkerPoolConfig};
//!
//! let config = WorkerPoolConfig::default()
//!     .with_worker_count(4)
//!     .with_concurrency(8);
//!
//! let pool = WorkerPool::new(queue, config, handler_fn(|job| async move {
//!     // Process the job...
//!     Ok(json!({"status": "completed"}))
//! }))?;
//!
//! pool.start().await?;
//!
//! // Graceful shutdown
//! pool.shutdown().await?;
//! ```

mod handler;
mod poller;
mod pool;
mod processor;
mod supervisor;

pub use handler::{handler_fn, simulated_work, JobHandler, JobResult};
pub use poller::{JobPoller, PollerConfig};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerPoolError, WorkerPoolStatus};
pub use processor::{JobProcessor, WorkerContext};
pub use supervisor::{Supervisor, SupervisorError};
