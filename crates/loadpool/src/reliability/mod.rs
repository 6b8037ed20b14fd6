//! Reliability policies for the worker pool
//!
//! This module provides:
//! - [`RetryPolicy`] - Bounded job retries with exponential backoff
//! - [`RestartBudget`] - Limit on how often the supervisor may replace workers

mod restart;
mod retry;

pub use restart::{RestartBudget, RestartTracker};
pub use retry::{RetryDecision, RetryPolicy};
