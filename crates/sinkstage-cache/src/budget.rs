//! Global byte budget shared by every table of one cache.
//!
//! Reservations run a compare-and-swap loop on a single atomic counter so
//! producers of different tables never contend on a mutex.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::metrics::{NoopGauge, UsageGauge};

/// Lock-free byte budget with gauge reporting.
pub struct MemoryBudget {
    capacity: u64,
    allocated: AtomicU64,
    gauge: Arc<dyn UsageGauge>,
}

impl MemoryBudget {
    /// Creates an empty budget of `capacity` bytes.
    pub fn new(capacity: u64, gauge: Arc<dyn UsageGauge>) -> Self {
        Self {
            capacity,
            allocated: AtomicU64::new(0),
            gauge,
        }
    }

    /// Creates a budget that reports to no gauge.
    pub fn unmetered(capacity: u64) -> Self {
        Self::new(capacity, Arc::new(NoopGauge))
    }

    /// Total bytes the budget can hand out.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes currently reserved.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Bytes still available.
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.allocated())
    }

    /// Attempts to reserve `size` bytes.
    ///
    /// Returns false without side effects when `allocated + size` would
    /// exceed the capacity. A lost race against another reservation is
    /// retried with the fresh value.
    pub fn try_reserve(&self, size: u64) -> bool {
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            let next = match current.checked_add(size) {
                Some(next) if next <= self.capacity => next,
                _ => return false,
            };
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.gauge.add(size);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Returns `size` previously reserved bytes to the budget.
    pub fn release(&self, size: u64) {
        if size == 0 {
            return;
        }
        let prev = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            })
            .unwrap_or_default();
        debug_assert!(
            prev >= size,
            "released {} bytes but only {} were allocated",
            size,
            prev
        );
        self.gauge.sub(size);
    }
}

impl fmt::Debug for MemoryBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBudget")
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated())
            .finish()
    }
}
