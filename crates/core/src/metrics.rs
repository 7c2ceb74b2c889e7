//! Telemetry contract for processed messages.

use std::sync::Arc;
use std::time::Duration;

use crate::outcome::Outcome;

/// Maximum length of a telemetry label value.
pub const MAX_LABEL_LEN: usize = 48;

/// Emits per-outcome latency and count telemetry.
///
/// Implementations are shared read-only across concurrent dispatches and must
/// never fail the caller: telemetry is optional infrastructure.
pub trait MetricsRecorder: Send + Sync {
    fn record(&self, worker: &str, outcome: Outcome, delivery_attempt: u32, duration: Duration);
}

impl<M> MetricsRecorder for Arc<M>
where
    M: MetricsRecorder + ?Sized,
{
    fn record(&self, worker: &str, outcome: Outcome, delivery_attempt: u32, duration: Duration) {
        (**self).record(worker, outcome, delivery_attempt, duration)
    }
}

/// Recorder that drops every measurement.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record(
        &self,
        _worker: &str,
        _outcome: Outcome,
        _delivery_attempt: u32,
        _duration: Duration,
    ) {
    }
}

/// Normalize a telemetry label: trimmed, lowercased, at most
/// [`MAX_LABEL_LEN`] characters, `unknown` when empty.
pub fn sanitize_label(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    if lowered.is_empty() {
        return "unknown".to_string();
    }
    lowered.chars().take(MAX_LABEL_LEN).collect()
}
