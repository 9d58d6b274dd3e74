//! Per-instance dispatch queue (§5 "Scheduling model"). Every external event
//! that wants to step a token goes through [`Dispatcher::admit`]: admission
//! is capacity-bounded (rejects with `EngineError::Busy` instead of queuing
//! unboundedly) and execution is serialized per instance via a logical lock,
//! so two events targeting the same instance never step concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::error::EngineError;

pub struct Dispatcher {
    capacity: Arc<Semaphore>,
    instance_locks: DashMap<Uuid, Arc<Mutex<()>>>,
    overruns: std::sync::atomic::AtomicU64,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: Arc::new(Semaphore::new(capacity)),
            instance_locks: DashMap::new(),
            overruns: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Try to reserve one slot in the bounded dispatch queue. `Busy` means
    /// the caller should back off — this never blocks.
    pub fn try_admit(&self) -> Result<OwnedSemaphorePermit, EngineError> {
        self.capacity.clone().try_acquire_owned().map_err(|_| EngineError::Busy)
    }

    /// The logical per-instance lock: only one stepping task holds it at a time.
    pub fn lock_for(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.instance_locks.entry(instance_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    pub fn note_overrun(&self) {
        self.overruns.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn overrun_count(&self) -> u64 {
        self.overruns.load(std::sync::atomic::Ordering::Relaxed)
    }
}
