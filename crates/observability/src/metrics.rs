//! Job telemetry recorders.
//!
//! Two signals are emitted per processed message, both labelled with the
//! sanitized `worker` and `outcome`:
//!
//! - [`LATENCY_METRIC`]: processing latency histogram in milliseconds
//! - [`EVENTS_METRIC`]: processed message counter

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use hanko_jobs_core::{MetricsRecorder, Outcome, sanitize_label};
use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, Meter};

/// Instrumentation scope of the job signals.
pub const METER_NAMESPACE: &str = "github.com/hanko-field/api/internal/jobs";
pub const LATENCY_METRIC: &str = "jobs.worker.latency";
pub const EVENTS_METRIC: &str = "jobs.worker.events";

/// Recorder backed by the process-wide OpenTelemetry meter provider.
///
/// When no provider is installed the global provider is a noop, so recording
/// is always safe.
#[derive(Clone)]
pub struct OtelMetrics {
    latency: Histogram<f64>,
    events: Counter<u64>,
}

impl OtelMetrics {
    /// Build the instruments from the global meter provider.
    pub fn new() -> Self {
        Self::from_meter(&opentelemetry::global::meter(METER_NAMESPACE))
    }

    pub fn from_meter(meter: &Meter) -> Self {
        let latency = meter
            .f64_histogram(LATENCY_METRIC)
            .with_unit("ms")
            .with_description("Latency of job processing in milliseconds")
            .build();
        let events = meter
            .u64_counter(EVENTS_METRIC)
            .with_description("Count of job processing outcomes")
            .build();
        Self { latency, events }
    }
}

impl Default for OtelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OtelMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtelMetrics")
            .field("namespace", &METER_NAMESPACE)
            .finish()
    }
}

impl MetricsRecorder for OtelMetrics {
    fn record(&self, worker: &str, outcome: Outcome, _delivery_attempt: u32, duration: Duration) {
        let attributes = [
            KeyValue::new("worker", sanitize_label(worker)),
            KeyValue::new("outcome", sanitize_label(outcome.as_str())),
        ];
        self.latency
            .record(duration.as_secs_f64() * 1000.0, &attributes);
        self.events.add(1, &attributes);
    }
}

/// A single measurement captured by [`InMemoryMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedMetric {
    pub worker: String,
    pub outcome: Outcome,
    pub delivery_attempt: u32,
    pub duration: Duration,
}

/// Recorder that keeps every measurement, for tests and local runs.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    records: Mutex<Vec<RecordedMetric>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RecordedMetric> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.records().into_iter().map(|r| r.outcome).collect()
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.records()
            .iter()
            .filter(|r| r.outcome == outcome)
            .count()
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn record(&self, worker: &str, outcome: Outcome, delivery_attempt: u32, duration: Duration) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedMetric {
                worker: sanitize_label(worker),
                outcome,
                delivery_attempt,
                duration,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_recorder_sanitizes_worker() {
        let metrics = InMemoryMetrics::new();
        metrics.record(" AI-Worker ", Outcome::Success, 1, Duration::from_millis(5));
        metrics.record("", Outcome::Retry, 2, Duration::ZERO);

        let records = metrics.records();
        assert_eq!(records[0].worker, "ai-worker");
        assert_eq!(records[1].worker, "unknown");
        assert_eq!(metrics.outcomes(), vec![Outcome::Success, Outcome::Retry]);
        assert_eq!(metrics.count(Outcome::Retry), 1);
    }

    #[test]
    fn otel_recorder_without_provider_is_noop() {
        let metrics = OtelMetrics::new();
        for outcome in Outcome::ALL {
            metrics.record("worker", outcome, 1, Duration::from_millis(1));
        }
    }
}
