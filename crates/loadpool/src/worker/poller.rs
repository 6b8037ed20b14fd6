//! Job polling with exponential backoff
//!
//! A worker claims jobs tagged for it. When nothing is ready the poll
//! interval grows up to `max_interval`; finding work resets it.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::queue::{ClaimedJob, JobQueue, QueueError};
use crate::registry::WorkerId;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Minimum poll interval (when jobs are available)
    #[serde(with = "crate::duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(with = "crate::duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no jobs found
    pub backoff_multiplier: f64,

    /// Maximum jobs to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(50),
            max_interval: Duration::from_secs(1),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Job poller with adaptive backoff
pub struct JobPoller {
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    worker_id: WorkerId,
    config: PollerConfig,
    current_interval: Duration,
}

impl JobPoller {
    /// Create a new job poller
    pub fn new(
        queue: Arc<dyn JobQueue>,
        queue_name: String,
        worker_id: WorkerId,
        config: PollerConfig,
    ) -> Self {
        Self {
            queue,
            queue_name,
            worker_id,
            current_interval: config.min_interval,
            config,
        }
    }

    /// Claim up to `max_jobs` jobs and update the backoff state
    #[instrument(skip(self), fields(worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_jobs: usize) -> Result<Vec<ClaimedJob>, QueueError> {
        let batch_size = max_jobs.min(self.config.batch_size);
        if batch_size == 0 {
            return Ok(vec![]);
        }

        let jobs = self
            .queue
            .claim(&self.queue_name, self.worker_id, batch_size)
            .await?;

        if jobs.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "No jobs found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = jobs.len(), "Claimed jobs");
        }

        Ok(jobs)
    }

    /// Sleep for the current backoff interval
    pub async fn wait(&self) {
        tokio::time::sleep(self.current_interval).await;
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let new_interval = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = new_interval.min(self.config.max_interval);
    }
}
