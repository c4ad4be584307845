//! Ordering key for buffered change events.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a change event within a table's stream.
///
/// Positions order by commit timestamp first, then start timestamp, so
/// events of the same transaction sort together and transactions sort in
/// commit order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    /// Commit timestamp of the enclosing transaction.
    pub commit_ts: u64,
    /// Start timestamp of the enclosing transaction.
    pub start_ts: u64,
}

impl Position {
    /// Creates a new position.
    pub fn new(commit_ts: u64, start_ts: u64) -> Self {
        Self {
            commit_ts,
            start_ts,
        }
    }

    /// Returns true for the zero position returned by an empty pop.
    pub fn is_zero(&self) -> bool {
        self.commit_ts == 0 && self.start_ts == 0
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Self) -> Ordering {
        self.commit_ts
            .cmp(&other.commit_ts)
            .then(self.start_ts.cmp(&other.start_ts))
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.commit_ts, self.start_ts)
    }
}

/// Anything that can be buffered must expose its position.
pub trait Positioned {
    /// Returns the ordering key of this event.
    fn position(&self) -> Position;
}

impl<T: Positioned + ?Sized> Positioned for std::sync::Arc<T> {
    fn position(&self) -> Position {
        (**self).position()
    }
}
