//! Usage gauge reporting for the staging cache.
//!
//! The cache reports every reserved and released byte to an injected
//! [`UsageGauge`]. Gauge updates are fire-and-forget: nothing a gauge does
//! can change admission or retrieval results.

use std::sync::Arc;

use prometheus::{GaugeVec, Opts, Registry};
use tracing::debug;

use crate::error::CacheResult;
use crate::event::JobId;

/// Metric name of the per-job staged byte gauge.
pub const CACHE_BYTES_METRIC: &str = "sinkstage_redo_event_cache_bytes";

/// Sink for incremental byte-count updates.
pub trait UsageGauge: Send + Sync {
    /// Records `bytes` newly held by the cache.
    fn add(&self, bytes: u64);
    /// Records `bytes` released by the cache.
    fn sub(&self, bytes: u64);
}

/// Gauge that discards every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopGauge;

impl UsageGauge for NoopGauge {
    fn add(&self, _bytes: u64) {}
    fn sub(&self, _bytes: u64) {}
}

impl UsageGauge for prometheus::Gauge {
    fn add(&self, bytes: u64) {
        prometheus::Gauge::add(self, bytes as f64);
    }

    fn sub(&self, bytes: u64) {
        prometheus::Gauge::sub(self, bytes as f64);
    }
}

/// Prometheus gauge family for staged bytes, one series per job.
#[derive(Clone)]
pub struct CacheMetrics {
    cache_bytes: GaugeVec,
}

impl CacheMetrics {
    /// Creates the gauge family and registers it with `registry`.
    pub fn register(registry: &Registry) -> CacheResult<Self> {
        let cache_bytes = GaugeVec::new(
            Opts::new(
                CACHE_BYTES_METRIC,
                "Bytes of redo events staged in memory per replication job",
            ),
            &["namespace", "job"],
        )?;
        registry.register(Box::new(cache_bytes.clone()))?;
        debug!(metric = CACHE_BYTES_METRIC, "registered cache metrics");
        Ok(Self { cache_bytes })
    }

    /// Returns the gauge series for `job_id`.
    pub fn gauge_for(&self, job_id: &JobId) -> Arc<dyn UsageGauge> {
        Arc::new(
            self.cache_bytes
                .with_label_values(&[job_id.namespace.as_str(), job_id.id.as_str()]),
        )
    }

    /// Drops the gauge series of a finished job.
    pub fn remove_job(&self, job_id: &JobId) {
        if let Err(err) = self
            .cache_bytes
            .remove_label_values(&[job_id.namespace.as_str(), job_id.id.as_str()])
        {
            debug!(job = %job_id, error = %err, "no gauge series to remove");
        }
    }
}
