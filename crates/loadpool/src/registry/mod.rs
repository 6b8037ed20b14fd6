//! Worker load registry
//!
//! This module provides:
//! - [`LoadRegistry`] - The single authoritative map of worker id to active job count
//! - [`WorkerId`] - Totally ordered worker identity used for deterministic tie-breaks
//! - [`WorkerRecord`] - A point-in-time view of one worker's load

mod load;

pub use load::{LoadRegistry, RegistryError, WorkerId, WorkerRecord};
