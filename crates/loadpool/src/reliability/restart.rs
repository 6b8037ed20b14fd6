//! Restart budget for worker replacement
//!
//! The supervisor replaces every dead worker, but a worker that dies right
//! after each spawn would otherwise be replaced forever. Once more than
//! `max_restarts` replacements happen within `window`, the supervisor gives
//! up and fails the pool.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Limit on worker replacements per sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartBudget {
    pub max_restarts: u32,

    #[serde(with = "crate::duration_millis")]
    pub window: Duration,
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self {
            max_restarts: 20,
            window: Duration::from_secs(60),
        }
    }
}

impl RestartBudget {
    pub fn new(max_restarts: u32, window: Duration) -> Self {
        Self {
            max_restarts,
            window,
        }
    }
}

/// Sliding-window counter for a [`RestartBudget`]
#[derive(Debug)]
pub struct RestartTracker {
    budget: RestartBudget,
    restarts: VecDeque<Instant>,
}

impl RestartTracker {
    pub fn new(budget: RestartBudget) -> Self {
        Self {
            budget,
            restarts: VecDeque::new(),
        }
    }

    /// Record a restart at `now`; returns `false` if the budget is exhausted
    pub fn try_record(&mut self, now: Instant) -> bool {
        while let Some(&oldest) = self.restarts.front() {
            if now.duration_since(oldest) >= self.budget.window {
                self.restarts.pop_front();
            } else {
                break;
            }
        }

        if self.restarts.len() >= self.budget.max_restarts as usize {
            return false;
        }
        self.restarts.push_back(now);
        true
    }

    /// Restarts currently counted in the window
    pub fn recent(&self) -> usize {
        self.restarts.len()
    }

    pub fn budget(&self) -> RestartBudget {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_exhausts_within_window() {
        let mut tracker = RestartTracker::new(RestartBudget::new(2, Duration::from_secs(10)));
        let start = Instant::now();

        assert!(tracker.try_record(start));
        assert!(tracker.try_record(start + Duration::from_secs(1)));
        assert!(!tracker.try_record(start + Duration::from_secs(2)));
        assert_eq!(tracker.recent(), 2);
    }

    #[test]
    fn test_budget_recovers_after_window() {
        let mut tracker = RestartTracker::new(RestartBudget::new(1, Duration::from_secs(10)));
        let start = Instant::now();

        assert!(tracker.try_record(start));
        assert!(!tracker.try_record(start + Duration::from_secs(5)));
        assert!(tracker.try_record(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_zero_budget_never_restarts() {
        let mut tracker = RestartTracker::new(RestartBudget::new(0, Duration::from_secs(10)));
        assert!(!tracker.try_record(Instant::now()));
    }
}
