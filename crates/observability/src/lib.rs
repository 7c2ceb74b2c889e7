//! Tracing, logging, metrics (shared setup).

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Tracing configuration (filters, layers).
pub mod tracing;

/// Job telemetry recorders.
pub mod metrics;

pub use hanko_jobs_core::sanitize_label;
pub use metrics::{
    EVENTS_METRIC, InMemoryMetrics, LATENCY_METRIC, METER_NAMESPACE, OtelMetrics, RecordedMetric,
};
