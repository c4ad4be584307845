//! Identifiers and the row-level change event carried by the cache.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::position::{Position, Positioned};

/// Identifier of a replicated source table.
pub type TableId = i64;

/// Identifier of the replication job that owns a cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId {
    /// Tenant or keyspace the job belongs to.
    pub namespace: String,
    /// Job name, unique within the namespace.
    pub id: String,
}

impl JobId {
    /// Creates a new job identifier.
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

/// A single row change captured from a source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowChangedEvent {
    /// Table the row belongs to.
    pub table_id: TableId,
    /// Commit timestamp of the enclosing transaction.
    pub commit_ts: u64,
    /// Start timestamp of the enclosing transaction.
    pub start_ts: u64,
    /// Encoded row image.
    pub payload: Vec<u8>,
}

impl RowChangedEvent {
    /// Creates a new row change event.
    pub fn new(table_id: TableId, commit_ts: u64, start_ts: u64, payload: Vec<u8>) -> Self {
        Self {
            table_id,
            commit_ts,
            start_ts,
            payload,
        }
    }

    /// Approximate in-memory footprint, usable as the admission size.
    pub fn approximate_size(&self) -> u64 {
        (std::mem::size_of::<Self>() + self.payload.len()) as u64
    }
}

impl Positioned for RowChangedEvent {
    fn position(&self) -> Position {
        Position::new(self.commit_ts, self.start_ts)
    }
}
