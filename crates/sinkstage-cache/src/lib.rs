#![warn(missing_docs)]

//! sinkstage cache subsystem: per-table redo event staging with a global memory budget
//!
//! Change events fetched from the sorter are staged here, per table, until
//! the durable writer takes them. Only events of fully buffered
//! transactions are handed out. All tables of a job share one byte
//! budget; a table whose admission would exceed it turns broken and its
//! producer falls back to re-reading from the source.

pub mod appender;
pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod position;

pub use appender::{AppendBuffer, AppenderStats, Popped};
pub use budget::MemoryBudget;
pub use cache::{CacheStats, EventCache};
pub use config::{CacheConfig, DEFAULT_CAPACITY_BYTES};
pub use error::{CacheError, CacheResult};
pub use event::{JobId, RowChangedEvent, TableId};
pub use metrics::{CacheMetrics, NoopGauge, UsageGauge, CACHE_BYTES_METRIC};
pub use position::{Position, Positioned};
