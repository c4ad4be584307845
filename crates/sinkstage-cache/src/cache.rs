//! Redo event cache for one replication job.
//!
//! The cache maps table ids to [`AppendBuffer`]s and owns the byte budget
//! they all draw from. The map lock only guards membership; buffer
//! contents are protected by each buffer's own lock. Locks are always
//! taken map first, buffer second.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::appender::{AppendBuffer, Popped};
use crate::budget::MemoryBudget;
use crate::config::CacheConfig;
use crate::error::CacheResult;
use crate::event::{JobId, RowChangedEvent, TableId};
use crate::metrics::{NoopGauge, UsageGauge};
use crate::position::{Position, Positioned};

/// Point-in-time view of a cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Byte budget of the cache.
    pub capacity_bytes: u64,
    /// Bytes currently held across all tables.
    pub allocated_bytes: u64,
    /// Number of tables with a live buffer.
    pub tables: usize,
}

impl CacheStats {
    /// Fraction of the budget in use, from 0.0 to 1.0.
    pub fn usage_ratio(&self) -> f64 {
        if self.capacity_bytes == 0 {
            0.0
        } else {
            self.allocated_bytes as f64 / self.capacity_bytes as f64
        }
    }
}

/// In-memory staging area for change events of one replication job.
pub struct EventCache<E = RowChangedEvent> {
    job_id: JobId,
    budget: Arc<MemoryBudget>,
    tables: Mutex<HashMap<TableId, Arc<AppendBuffer<E>>>>,
}

impl<E> EventCache<E> {
    /// Creates a cache with a `capacity` byte budget and no gauge.
    pub fn new(job_id: JobId, capacity: u64) -> Self {
        Self::with_gauge(job_id, capacity, Arc::new(NoopGauge))
    }

    /// Creates a cache that reports held bytes to `gauge`.
    pub fn with_gauge(job_id: JobId, capacity: u64, gauge: Arc<dyn UsageGauge>) -> Self {
        debug!(job = %job_id, capacity, "created redo event cache");
        Self {
            job_id,
            budget: Arc::new(MemoryBudget::new(capacity, gauge)),
            tables: Mutex::new(HashMap::new()),
        }
    }

    /// Validates `config` and creates a cache from it.
    pub fn from_config(
        job_id: JobId,
        config: &CacheConfig,
        gauge: Arc<dyn UsageGauge>,
    ) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self::with_gauge(job_id, config.capacity_bytes, gauge))
    }

    /// Job this cache belongs to.
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Byte budget of the cache.
    pub fn capacity(&self) -> u64 {
        self.budget.capacity()
    }

    /// Bytes currently held across all tables.
    pub fn allocated(&self) -> u64 {
        self.budget.allocated()
    }

    /// Number of tables with a live buffer.
    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }

    /// Whether `table_id` currently has a buffer.
    pub fn contains_table(&self, table_id: TableId) -> bool {
        self.tables.lock().contains_key(&table_id)
    }

    /// Returns a snapshot of the cache.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            capacity_bytes: self.capacity(),
            allocated_bytes: self.allocated(),
            tables: self.table_count(),
        }
    }

    /// Returns the buffer of `table_id`, creating it if needed.
    pub fn get_appender(&self, table_id: TableId) -> Arc<AppendBuffer<E>> {
        let mut tables = self.tables.lock();
        let appender = tables.entry(table_id).or_insert_with(|| {
            debug!(job = %self.job_id, table_id, "created appender");
            Arc::new(AppendBuffer::new(table_id, Arc::clone(&self.budget)))
        });
        Arc::clone(appender)
    }

    /// Tears down the buffer of `table_id`.
    ///
    /// Every buffered event is discarded and its bytes go back to the
    /// budget. Producers still holding the buffer get `false` from any
    /// further push.
    pub fn remove_table(&self, table_id: TableId) {
        let mut tables = self.tables.lock();
        let Some(appender) = tables.remove(&table_id) else {
            return;
        };
        let (released, pending) = appender.retire();
        drop(tables);

        if pending > 0 {
            warn!(
                job = %self.job_id,
                table_id,
                pending,
                "removed table with an unfinished transaction buffered"
            );
        }
        info!(job = %self.job_id, table_id, released, "removed table from redo event cache");
    }
}

impl<E: Positioned> EventCache<E> {
    /// Removes ready events of `table_id`, up to `bound` when given.
    ///
    /// Returns an empty result when the table has no buffer or nothing is
    /// ready. A buffer drained to empty is dropped from the cache and
    /// retired; a producer still holding it gets `false` from its next push
    /// and must call [`EventCache::get_appender`] again. At most one thread
    /// may pop a given table.
    pub fn pop(&self, table_id: TableId, bound: Option<Position>) -> Popped<E> {
        let appender = match self.tables.lock().get(&table_id) {
            Some(appender) => Arc::clone(appender),
            None => return Popped::empty(),
        };

        let popped = appender.take_ready(bound);
        if !popped.is_empty() {
            self.remove_if_drained(table_id, &appender);
        }
        popped
    }

    fn remove_if_drained(&self, table_id: TableId, appender: &Arc<AppendBuffer<E>>) {
        let mut tables = self.tables.lock();
        let Some(current) = tables.get(&table_id) else {
            return;
        };
        // Retiring under the buffer lock means a concurrent push either
        // landed first (buffer not empty, entry kept) or is rejected.
        if Arc::ptr_eq(current, appender) && appender.retire_if_empty() {
            tables.remove(&table_id);
            debug!(job = %self.job_id, table_id, "dropped drained appender");
        }
    }
}

impl<E> fmt::Debug for EventCache<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCache")
            .field("job_id", &self.job_id)
            .field("budget", &self.budget)
            .field("tables", &self.table_count())
            .finish()
    }
}
