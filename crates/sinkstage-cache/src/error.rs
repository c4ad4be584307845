//! Error types for the staging cache.
//!
//! Admission and retrieval never fail: they report backpressure and
//! "nothing ready" through return values. Only construction can fail.

use thiserror::Error;

/// Result type alias for cache construction.
pub type CacheResult<T> = Result<T, CacheError>;

/// Error variants for cache construction.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The supplied configuration is unusable.
    #[error("Invalid cache config: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// Registering or creating the usage gauge failed.
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
