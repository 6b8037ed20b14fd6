//! LoadRegistry implementation
//!
//! All mutations are serialized through one `parking_lot::Mutex`. Workers,
//! the dispatcher and the supervisor share the same `Arc<LoadRegistry>`;
//! nothing keeps its own copy of the load table.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error};

/// Worker identity
///
/// Ids are allocated from a monotonically increasing counter and never
/// reused. Their ordering is the tie-break order for [`LoadRegistry::select_least`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

impl From<u64> for WorkerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Snapshot of a worker's load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    pub active_job_count: u64,
}

/// Registry errors
///
/// `UnknownWorker`, `DuplicateWorker` and `LoadUnderflow` indicate
/// accounting defects and are logged loudly at the call site.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Register collided with an existing entry
    #[error("worker already registered: {0}")]
    DuplicateWorker(WorkerId),

    /// Adjust or deregister on an absent entry
    #[error("unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// Selection on an empty registry
    #[error("no workers available")]
    NoWorkersAvailable,

    /// Adjust would drive the load below zero
    #[error("load underflow for {worker_id}: current {current}, delta {delta}")]
    LoadUnderflow {
        worker_id: WorkerId,
        current: u64,
        delta: i64,
    },
}

/// Authoritative mapping from worker id to active job count
///
/// Besides the load table, the registry carries a *membership gate*: an
/// async reader/writer lock that dispatch holds shared from assignment until
/// the job is enqueued, and that the supervisor holds exclusively while it
/// swaps a dead worker out and reaps its jobs. A job therefore can never be
/// tagged for a worker whose orphans were already reaped.
///
/// # Example
///
/// ```
/// use loadpool::{LoadRegistry, WorkerId};
///
/// let registry = LoadRegistry::with_workers((1..=2).map(WorkerId::new)).unwrap();
/// let first = registry.assign_least().unwrap();
/// let second = registry.assign_least().unwrap();
///
/// assert_eq!(first, WorkerId::new(1));
/// assert_eq!(second, WorkerId::new(2));
/// ```
#[derive(Default)]
pub struct LoadRegistry {
    workers: Mutex<BTreeMap<WorkerId, u64>>,
    membership: RwLock<()>,
}

impl LoadRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with one zero-load entry per worker
    pub fn with_workers(ids: impl IntoIterator<Item = WorkerId>) -> Result<Self, RegistryError> {
        let registry = Self::new();
        for id in ids {
            registry.register(id)?;
        }
        Ok(registry)
    }

    /// Insert a zero-load entry
    pub fn register(&self, worker_id: WorkerId) -> Result<(), RegistryError> {
        let mut workers = self.workers.lock();
        if workers.contains_key(&worker_id) {
            return Err(RegistryError::DuplicateWorker(worker_id));
        }
        workers.insert(worker_id, 0);
        debug!(%worker_id, "Registered worker");
        Ok(())
    }

    /// Remove an entry, returning its final load
    pub fn deregister(&self, worker_id: WorkerId) -> Result<WorkerRecord, RegistryError> {
        let active_job_count = self
            .workers
            .lock()
            .remove(&worker_id)
            .ok_or(RegistryError::UnknownWorker(worker_id))?;
        debug!(%worker_id, active_job_count, "Deregistered worker");
        Ok(WorkerRecord {
            worker_id,
            active_job_count,
        })
    }

    /// Worker with the lowest load; ties go to the lowest id
    pub fn select_least(&self) -> Result<WorkerId, RegistryError> {
        least_loaded(&self.workers.lock())
    }

    /// Add `delta` to a worker's load and return the new value
    pub fn adjust(&self, worker_id: WorkerId, delta: i64) -> Result<u64, RegistryError> {
        let mut workers = self.workers.lock();
        let load = workers
            .get_mut(&worker_id)
            .ok_or(RegistryError::UnknownWorker(worker_id))?;
        *load = apply_delta(worker_id, *load, delta)?;
        Ok(*load)
    }

    /// Select the least-loaded worker and increment it in one critical section
    pub fn assign_least(&self) -> Result<WorkerId, RegistryError> {
        let mut workers = self.workers.lock();
        let worker_id = least_loaded(&workers)?;
        if let Some(load) = workers.get_mut(&worker_id) {
            *load += 1;
        }
        Ok(worker_id)
    }

    /// Swap `dead` for a fresh zero-load `replacement` atomically
    ///
    /// Fails without touching the table if `dead` is absent or
    /// `replacement` already exists, so the visible pool size never shrinks.
    pub fn replace(
        &self,
        dead: WorkerId,
        replacement: WorkerId,
    ) -> Result<WorkerRecord, RegistryError> {
        let mut workers = self.workers.lock();
        if workers.contains_key(&replacement) {
            return Err(RegistryError::DuplicateWorker(replacement));
        }
        let active_job_count = workers
            .remove(&dead)
            .ok_or(RegistryError::UnknownWorker(dead))?;
        workers.insert(replacement, 0);
        debug!(%dead, %replacement, active_job_count, "Replaced worker");
        Ok(WorkerRecord {
            worker_id: dead,
            active_job_count,
        })
    }

    /// Current load of a worker
    pub fn load(&self, worker_id: WorkerId) -> Option<u64> {
        self.workers.lock().get(&worker_id).copied()
    }

    pub fn contains(&self, worker_id: WorkerId) -> bool {
        self.workers.lock().contains_key(&worker_id)
    }

    /// All records in ascending id order
    pub fn snapshot(&self) -> Vec<WorkerRecord> {
        self.workers
            .lock()
            .iter()
            .map(|(&worker_id, &active_job_count)| WorkerRecord {
                worker_id,
                active_job_count,
            })
            .collect()
    }

    /// Sum of all loads
    pub fn total_load(&self) -> u64 {
        self.workers.lock().values().sum()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().is_empty()
    }

    /// Hold membership shared (dispatch, cancellation)
    pub async fn membership(&self) -> RwLockReadGuard<'_, ()> {
        self.membership.read().await
    }

    /// Hold membership exclusively (worker replacement and reaping)
    pub async fn membership_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.membership.write().await
    }
}

impl fmt::Debug for LoadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadRegistry")
            .field("workers", &*self.workers.lock())
            .finish()
    }
}

fn least_loaded(workers: &BTreeMap<WorkerId, u64>) -> Result<WorkerId, RegistryError> {
    // BTreeMap iterates in ascending id order; min_by_key keeps the first minimum.
    workers
        .iter()
        .min_by_key(|(_, load)| **load)
        .map(|(&id, _)| id)
        .ok_or(RegistryError::NoWorkersAvailable)
}

fn apply_delta(worker_id: WorkerId, current: u64, delta: i64) -> Result<u64, RegistryError> {
    let next = if delta >= 0 {
        current.checked_add(delta.unsigned_abs())
    } else {
        current.checked_sub(delta.unsigned_abs())
    };
    next.ok_or_else(|| {
        error!(%worker_id, current, delta, "Load accounting would underflow");
        RegistryError::LoadUnderflow {
            worker_id,
            current,
            delta,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(range: std::ops::RangeInclusive<u64>) -> Vec<WorkerId> {
        range.map(WorkerId::new).collect()
    }

    fn loads(registry: &LoadRegistry) -> Vec<u64> {
        registry
            .snapshot()
            .into_iter()
            .map(|r| r.active_job_count)
            .collect()
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let registry = LoadRegistry::new();
        registry.register(WorkerId::new(1)).unwrap();

        assert_eq!(
            registry.register(WorkerId::new(1)),
            Err(RegistryError::DuplicateWorker(WorkerId::new(1)))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_deregister_unknown_worker() {
        let registry = LoadRegistry::new();
        assert_eq!(
            registry.deregister(WorkerId::new(7)),
            Err(RegistryError::UnknownWorker(WorkerId::new(7)))
        );
    }

    #[test]
    fn test_adjust_unknown_worker_fails_loudly() {
        let registry = LoadRegistry::with_workers(ids(1..=2)).unwrap();

        assert_eq!(
            registry.adjust(WorkerId::new(9), 1),
            Err(RegistryError::UnknownWorker(WorkerId::new(9)))
        );
        assert_eq!(
            registry.adjust(WorkerId::new(9), -1),
            Err(RegistryError::UnknownWorker(WorkerId::new(9)))
        );
        assert_eq!(registry.total_load(), 0);
    }

    #[test]
    fn test_adjust_rejects_underflow() {
        let registry = LoadRegistry::with_workers(ids(1..=1)).unwrap();

        let err = registry.adjust(WorkerId::new(1), -1).unwrap_err();
        assert!(matches!(err, RegistryError::LoadUnderflow { current: 0, .. }));
        assert_eq!(registry.load(WorkerId::new(1)), Some(0));
    }

    #[test]
    fn test_select_least_on_empty_registry() {
        let registry = LoadRegistry::new();
        assert_eq!(
            registry.select_least(),
            Err(RegistryError::NoWorkersAvailable)
        );
    }

    #[test]
    fn test_select_least_picks_minimum() {
        let registry = LoadRegistry::with_workers(ids(1..=3)).unwrap();
        registry.adjust(WorkerId::new(1), 3).unwrap();
        registry.adjust(WorkerId::new(2), 1).unwrap();
        registry.adjust(WorkerId::new(3), 2).unwrap();

        let chosen = registry.select_least().unwrap();
        let chosen_load = registry.load(chosen).unwrap();

        assert_eq!(chosen, WorkerId::new(2));
        assert!(registry
            .snapshot()
            .iter()
            .all(|r| chosen_load <= r.active_job_count));
    }

    #[test]
    fn test_tie_break_is_ascending_id() {
        // Registered out of order on purpose
        let registry = LoadRegistry::with_workers([3, 1, 2].map(WorkerId::new)).unwrap();
        assert_eq!(registry.select_least().unwrap(), WorkerId::new(1));
    }

    #[test]
    fn test_five_submissions_over_four_workers() {
        let registry = LoadRegistry::with_workers(ids(1..=4)).unwrap();

        let assigned: Vec<u64> = (0..5)
            .map(|_| registry.assign_least().unwrap().get())
            .collect();

        assert_eq!(assigned, vec![1, 2, 3, 4, 1]);
        assert_eq!(loads(&registry), vec![2, 1, 1, 1]);
    }

    #[test]
    fn test_select_after_last_worker_deregistered() {
        let registry = LoadRegistry::with_workers(ids(1..=1)).unwrap();

        assert_eq!(registry.select_least().unwrap(), WorkerId::new(1));
        registry.deregister(WorkerId::new(1)).unwrap();
        assert_eq!(
            registry.select_least(),
            Err(RegistryError::NoWorkersAvailable)
        );
    }

    #[test]
    fn test_replace_is_atomic() {
        let registry = LoadRegistry::with_workers(ids(1..=2)).unwrap();
        registry.adjust(WorkerId::new(1), 4).unwrap();

        let dead = registry
            .replace(WorkerId::new(1), WorkerId::new(3))
            .unwrap();

        assert_eq!(dead.active_job_count, 4);
        assert_eq!(registry.len(), 2);
        assert!(!registry.contains(WorkerId::new(1)));
        assert_eq!(registry.load(WorkerId::new(3)), Some(0));
    }

    #[test]
    fn test_replace_failures_leave_table_untouched() {
        let registry = LoadRegistry::with_workers(ids(1..=2)).unwrap();

        assert_eq!(
            registry.replace(WorkerId::new(1), WorkerId::new(2)),
            Err(RegistryError::DuplicateWorker(WorkerId::new(2)))
        );
        assert_eq!(
            registry.replace(WorkerId::new(5), WorkerId::new(6)),
            Err(RegistryError::UnknownWorker(WorkerId::new(5)))
        );
        assert_eq!(
            registry.snapshot().iter().map(|r| r.worker_id.get()).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn test_assign_then_release_round_trip() {
        let registry = LoadRegistry::with_workers(ids(1..=3)).unwrap();
        registry.adjust(WorkerId::new(2), 2).unwrap();
        let before = loads(&registry);

        let worker = registry.assign_least().unwrap();
        registry.adjust(worker, -1).unwrap();

        assert_eq!(loads(&registry), before);
    }

    #[test]
    fn test_concurrent_assignment_stays_balanced() {
        let registry = std::sync::Arc::new(LoadRegistry::with_workers(ids(1..=4)).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        registry.assign_least().unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.total_load(), 800);
        assert_eq!(loads(&registry), vec![200, 200, 200, 200]);
    }

    #[test]
    fn test_worker_id_display() {
        assert_eq!(WorkerId::new(12).to_string(), "worker-12");
    }
}
