//! Durable queue boundary
//!
//! This module provides:
//! - [`JobQueue`] trait for the queue that hands jobs from the dispatcher to workers
//! - [`InMemoryJobQueue`] reference backend for tests and single-node deployments

mod memory;
mod store;

pub use memory::InMemoryJobQueue;
pub use store::{
    ClaimedJob, JobDefinition, JobId, JobOptions, JobQueue, JobRecord, JobStatus, QueueError,
};
