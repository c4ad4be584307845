//! Staging cache configuration.

use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};

/// Default byte budget for one replication job (64MB).
pub const DEFAULT_CAPACITY_BYTES: u64 = 64 * 1024 * 1024;

/// Configuration for one [`EventCache`](crate::cache::EventCache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget shared by every table of the job (default 64MB).
    pub capacity_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
        }
    }
}

impl CacheConfig {
    /// Creates a config with the given byte budget.
    pub fn with_capacity(capacity_bytes: u64) -> Self {
        Self { capacity_bytes }
    }

    /// Checks that the config describes a usable cache.
    pub fn validate(&self) -> CacheResult<()> {
        if self.capacity_bytes == 0 {
            return Err(CacheError::InvalidConfig {
                reason: "capacity_bytes must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}
