//! Per-table append buffer.
//!
//! Events are appended at the tail by a single producer and drained from
//! the head by a single consumer. The buffer tracks three parallel
//! sequences (events, byte costs, provenance markers) plus a ready
//! boundary: `events[..ready_count]` belong to fully buffered
//! transactions and may be retrieved, the rest are pending.
//!
//! Admission reserves bytes from the cache-wide [`MemoryBudget`]. When a
//! reservation fails the buffer turns broken and rejects every further
//! push until [`AppendBuffer::clean_broken_events`] drops the pending tail.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::budget::MemoryBudget;
use crate::event::TableId;
use crate::position::{Position, Positioned};

/// Events retrieved by one pop.
#[derive(Debug, Clone, PartialEq)]
pub struct Popped<E> {
    /// Retrieved events in position order.
    pub events: Vec<E>,
    /// Sum of the admission sizes of the retrieved events.
    pub size: u64,
    /// Position of the last retrieved event, zero when nothing was popped.
    pub position: Position,
    /// Number of admission calls that contributed the retrieved events.
    pub push_count: usize,
}

impl<E> Popped<E> {
    /// An empty result: nothing was ready.
    pub fn empty() -> Self {
        Self {
            events: Vec::new(),
            size: 0,
            position: Position::default(),
            push_count: 0,
        }
    }

    /// Returns true if no event was retrieved.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Number of retrieved events.
    pub fn len(&self) -> usize {
        self.events.len()
    }
}

/// Point-in-time view of one append buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppenderStats {
    /// Table the buffer belongs to.
    pub table_id: TableId,
    /// Events currently buffered.
    pub events: usize,
    /// Events eligible for retrieval.
    pub ready_events: usize,
    /// Bytes held by all buffered events.
    pub buffered_bytes: u64,
    /// Bytes held by pending events.
    pub pending_bytes: u64,
    /// Whether admission is currently rejected.
    pub broken: bool,
}

struct BufferState<E> {
    events: VecDeque<E>,
    sizes: VecDeque<u64>,
    // 1 for the first event of an admission call, 0 for the others.
    push_counts: VecDeque<u8>,
    ready_count: usize,
}

impl<E> BufferState<E> {
    fn new() -> Self {
        Self {
            events: VecDeque::new(),
            sizes: VecDeque::new(),
            push_counts: VecDeque::new(),
            ready_count: 0,
        }
    }

    fn pending_bytes(&self) -> u64 {
        self.sizes.iter().skip(self.ready_count).sum()
    }
}

/// Ordered buffer of change events for one table.
pub struct AppendBuffer<E> {
    table_id: TableId,
    budget: Arc<MemoryBudget>,
    broken: AtomicBool,
    // Set under the state write lock; once set, the buffer is unlinked
    // from its cache and never admits again.
    retired: AtomicBool,
    state: RwLock<BufferState<E>>,
}

impl<E> AppendBuffer<E> {
    pub(crate) fn new(table_id: TableId, budget: Arc<MemoryBudget>) -> Self {
        Self {
            table_id,
            budget,
            broken: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            state: RwLock::new(BufferState::new()),
        }
    }

    /// Table this buffer belongs to.
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Admits one event plus the events decoded from the same source record.
    ///
    /// `size` is charged to the primary event; accompanying events cost
    /// nothing. When `txn_finished` is set every buffered event becomes
    /// ready. Returns false if the buffer is broken, if the budget cannot
    /// cover `size`, or if the buffer was unlinked from its cache; the
    /// last two also break the buffer. A rejected call stores nothing.
    /// After a rejection on a retired buffer the producer must fetch a new
    /// one with [`EventCache::get_appender`](crate::cache::EventCache::get_appender).
    ///
    /// At most one thread may push to a given buffer.
    pub fn push<I>(&self, event: E, size: u64, txn_finished: bool, same_record: I) -> bool
    where
        I: IntoIterator<Item = E>,
    {
        if self.broken.load(Ordering::Acquire) {
            return false;
        }
        if self.retired.load(Ordering::Acquire) {
            self.broken.store(true, Ordering::Release);
            return false;
        }

        if !self.budget.try_reserve(size) {
            self.broken.store(true, Ordering::Release);
            debug!(
                table_id = self.table_id,
                size,
                allocated = self.budget.allocated(),
                capacity = self.budget.capacity(),
                "cache budget exhausted, appender broken"
            );
            return false;
        }

        let mut state = self.state.write();
        if self.retired.load(Ordering::Acquire) {
            drop(state);
            self.budget.release(size);
            self.broken.store(true, Ordering::Release);
            return false;
        }

        state.events.push_back(event);
        state.sizes.push_back(size);
        state.push_counts.push_back(1);
        for event in same_record {
            state.events.push_back(event);
            state.sizes.push_back(0);
            state.push_counts.push_back(0);
        }
        if txn_finished {
            state.ready_count = state.events.len();
        }
        true
    }

    /// Admits events that all come from one source record.
    ///
    /// The first event is the primary one; an empty batch is accepted
    /// without touching the buffer.
    pub fn push_batch(&self, events: Vec<E>, size: u64, txn_finished: bool) -> bool {
        let mut events = events.into_iter();
        match events.next() {
            Some(first) => self.push(first, size, txn_finished, events),
            None => true,
        }
    }

    /// Drops every pending event and clears the broken flag.
    ///
    /// Returns the number of bytes handed back to the budget. Ready events
    /// stay buffered.
    pub fn clean_broken_events(&self) -> u64 {
        let mut state = self.state.write();
        let ready = state.ready_count;
        let dropped = state.events.len() - ready;
        let reclaimed = state.pending_bytes();

        state.events.truncate(ready);
        state.sizes.truncate(ready);
        state.push_counts.truncate(ready);
        self.broken.store(false, Ordering::Release);
        drop(state);

        self.budget.release(reclaimed);
        debug!(
            table_id = self.table_id,
            dropped,
            reclaimed,
            "cleaned broken appender"
        );
        reclaimed
    }

    /// Whether admission is currently rejected.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Whether the buffer was unlinked from its cache, by a drain or by
    /// table teardown. A retired buffer rejects every push.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    /// Number of buffered events, ready and pending.
    pub fn len(&self) -> usize {
        self.state.read().events.len()
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.state.read().events.is_empty()
    }

    /// Number of events eligible for retrieval.
    pub fn ready_count(&self) -> usize {
        self.state.read().ready_count
    }

    /// Returns a snapshot of the buffer.
    pub fn stats(&self) -> AppenderStats {
        let state = self.state.read();
        AppenderStats {
            table_id: self.table_id,
            events: state.events.len(),
            ready_events: state.ready_count,
            buffered_bytes: state.sizes.iter().sum(),
            pending_bytes: state.pending_bytes(),
            broken: self.is_broken(),
        }
    }

    /// Discards everything and rejects future pushes.
    ///
    /// Returns `(buffered_bytes, pending_bytes)` released to the budget.
    pub(crate) fn retire(&self) -> (u64, u64) {
        let mut state = self.state.write();
        let buffered: u64 = state.sizes.iter().sum();
        let pending = state.pending_bytes();

        state.events.clear();
        state.sizes.clear();
        state.push_counts.clear();
        state.ready_count = 0;
        self.retired.store(true, Ordering::Release);
        drop(state);

        self.budget.release(buffered);
        (buffered, pending)
    }

    /// Retires the buffer if nothing is buffered; returns whether it did.
    pub(crate) fn retire_if_empty(&self) -> bool {
        let state = self.state.write();
        if !state.events.is_empty() {
            return false;
        }
        self.retired.store(true, Ordering::Release);
        true
    }
}

impl<E: Positioned> AppendBuffer<E> {
    /// Removes the longest ready prefix whose positions are `<= bound`.
    ///
    /// Without a bound the whole ready prefix is taken. Positions are
    /// non-decreasing along the buffer, so the cut is found by binary
    /// search. At most one thread may take from a given buffer.
    pub(crate) fn take_ready(&self, bound: Option<Position>) -> Popped<E> {
        let mut state = self.state.write();
        let ready = state.ready_count;
        if ready == 0 {
            return Popped::empty();
        }

        let fetch = match bound {
            None => ready,
            Some(bound) => state.events.make_contiguous()[..ready]
                .partition_point(|event| event.position() <= bound),
        };
        if fetch == 0 {
            return Popped::empty();
        }

        let events: Vec<E> = state.events.drain(..fetch).collect();
        let size: u64 = state.sizes.drain(..fetch).sum();
        let push_count: usize = state.push_counts.drain(..fetch).map(usize::from).sum();
        state.ready_count -= fetch;
        drop(state);

        self.budget.release(size);
        let position = events
            .last()
            .map(Positioned::position)
            .unwrap_or_default();
        Popped {
            events,
            size,
            position,
            push_count,
        }
    }
}

impl<E> fmt::Debug for AppendBuffer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("AppendBuffer")
            .field("table_id", &self.table_id)
            .field("events", &state.events.len())
            .field("ready_count", &state.ready_count)
            .field("broken", &self.is_broken())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::RowChangedEvent;
    use std::iter;

    fn row(commit_ts: u64) -> RowChangedEvent {
        RowChangedEvent::new(1, commit_ts, commit_ts - 1, vec![])
    }

    fn appender(capacity: u64) -> (AppendBuffer<RowChangedEvent>, Arc<MemoryBudget>) {
        let budget = Arc::new(MemoryBudget::unmetered(capacity));
        (AppendBuffer::new(1, Arc::clone(&budget)), budget)
    }

    #[test]
    fn test_push_reserves_budget() {
        let (buf, budget) = appender(100);
        assert!(buf.push(row(10), 40, true, iter::empty()));
        assert_eq!(budget.allocated(), 40);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.ready_count(), 1);
    }

    #[test]
    fn test_pending_until_txn_finished() {
        let (buf, _budget) = appender(100);
        assert!(buf.push(row(10), 10, false, iter::empty()));
        assert!(buf.push(row(10), 10, false, iter::empty()));
        assert_eq!(buf.ready_count(), 0);
        assert!(buf.push(row(10), 10, true, iter::empty()));
        assert_eq!(buf.ready_count(), 3);
        assert!(buf.push(row(20), 10, false, iter::empty()));
        assert_eq!(buf.ready_count(), 3);
        assert_eq!(buf.len(), 4);
    }

    #[test]
    fn test_same_record_events_cost_nothing() {
        let (buf, budget) = appender(100);
        assert!(buf.push(row(10), 30, true, vec![row(10), row(10)]));
        assert_eq!(budget.allocated(), 30);

        let popped = buf.take_ready(None);
        assert_eq!(popped.len(), 3);
        assert_eq!(popped.size, 30);
        assert_eq!(popped.push_count, 1);
    }

    #[test]
    fn test_push_batch_empty_is_noop() {
        let (buf, budget) = appender(100);
        assert!(buf.push_batch(vec![], 50, true));
        assert!(buf.is_empty());
        assert_eq!(budget.allocated(), 0);
    }

    #[test]
    fn test_push_batch_first_is_primary() {
        let (buf, _budget) = appender(100);
        assert!(buf.push_batch(vec![row(10), row(10), row(10)], 30, true));
        let stats = buf.stats();
        assert_eq!(stats.events, 3);
        assert_eq!(stats.ready_events, 3);
        assert_eq!(stats.buffered_bytes, 30);
    }

    #[test]
    fn test_overflow_breaks_appender() {
        let (buf, budget) = appender(100);
        assert!(buf.push(row(10), 40, true, iter::empty()));
        assert!(!buf.push(row(20), 70, false, iter::empty()));
        assert!(buf.is_broken());
        assert_eq!(buf.len(), 1);
        assert_eq!(budget.allocated(), 40);
    }

    #[test]
    fn test_broken_rejects_even_small_pushes() {
        let (buf, budget) = appender(100);
        assert!(!buf.push(row(10), 101, false, iter::empty()));
        assert!(!buf.push(row(10), 1, false, iter::empty()));
        assert!(!buf.push_batch(vec![row(10)], 0, true));
        assert_eq!(budget.allocated(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_clean_broken_events_drops_pending_tail() {
        let (buf, budget) = appender(100);
        assert!(buf.push(row(10), 20, true, iter::empty()));
        assert!(buf.push(row(20), 20, false, vec![row(20)]));
        assert!(!buf.push(row(20), 80, false, iter::empty()));
        assert!(buf.is_broken());

        let reclaimed = buf.clean_broken_events();
        assert_eq!(reclaimed, 20);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.ready_count(), 1);
        assert!(!buf.is_broken());
        assert_eq!(budget.allocated(), 20);

        assert!(buf.push(row(30), 50, true, iter::empty()));
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_clean_without_pending_is_harmless() {
        let (buf, budget) = appender(100);
        assert!(buf.push(row(10), 20, true, iter::empty()));
        assert_eq!(buf.clean_broken_events(), 0);
        assert_eq!(buf.len(), 1);
        assert_eq!(budget.allocated(), 20);
    }

    #[test]
    fn test_take_ready_skips_pending() {
        let (buf, budget) = appender(100);
        assert!(buf.push(row(10), 10, true, iter::empty()));
        assert!(buf.push(row(20), 10, false, iter::empty()));

        let popped = buf.take_ready(None);
        assert_eq!(popped.len(), 1);
        assert_eq!(popped.position, Position::new(10, 9));
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.ready_count(), 0);
        assert_eq!(budget.allocated(), 10);

        assert!(buf.take_ready(None).is_empty());
    }

    #[test]
    fn test_take_ready_with_bound() {
        let (buf, budget) = appender(1000);
        for ts in [10, 20, 30, 40] {
            assert!(buf.push(row(ts), 10, true, iter::empty()));
        }

        let popped = buf.take_ready(Some(Position::new(25, 0)));
        assert_eq!(popped.len(), 2);
        assert_eq!(popped.position, Position::new(20, 19));
        assert_eq!(buf.ready_count(), 2);
        assert_eq!(budget.allocated(), 20);

        assert!(buf.take_ready(Some(Position::new(29, 100))).is_empty());
        let popped = buf.take_ready(Some(Position::new(30, 29)));
        assert_eq!(popped.len(), 1);
    }

    #[test]
    fn test_retire_releases_everything() {
        let (buf, budget) = appender(100);
        assert!(buf.push(row(10), 30, true, iter::empty()));
        assert!(buf.push(row(20), 25, false, iter::empty()));

        assert_eq!(buf.retire(), (55, 25));
        assert_eq!(budget.allocated(), 0);
        assert!(buf.is_empty());

        assert!(buf.is_retired());
        assert!(!buf.push(row(30), 5, true, iter::empty()));
        assert!(buf.is_broken());
        assert_eq!(budget.allocated(), 0);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_retired_stays_rejected_after_clean() {
        let (buf, budget) = appender(100);
        buf.retire();
        assert!(!buf.push(row(10), 5, true, iter::empty()));
        assert!(buf.is_broken());

        assert_eq!(buf.clean_broken_events(), 0);
        assert!(!buf.is_broken());
        assert!(!buf.push(row(10), 5, true, iter::empty()));
        assert!(buf.is_broken());
        assert!(buf.is_retired());
        assert_eq!(budget.allocated(), 0);
    }

    #[test]
    fn test_retire_if_empty() {
        let (buf, _budget) = appender(100);
        assert!(buf.push(row(10), 5, false, iter::empty()));
        assert!(!buf.retire_if_empty());
        assert!(!buf.is_retired());

        assert_eq!(buf.clean_broken_events(), 5);
        assert!(buf.retire_if_empty());
        assert!(buf.is_retired());
        assert!(!buf.push(row(20), 5, true, iter::empty()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_stats_snapshot() {
        let (buf, _budget) = appender(100);
        assert!(buf.push(row(10), 30, true, iter::empty()));
        assert!(buf.push(row(20), 25, false, iter::empty()));
        assert_eq!(
            buf.stats(),
            AppenderStats {
                table_id: 1,
                events: 2,
                ready_events: 1,
                buffered_bytes: 55,
                pending_bytes: 25,
                broken: false,
            }
        );
    }
}
