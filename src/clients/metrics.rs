use tracing::debug;

use crate::models::circuit_breaker::CircuitState;

/// Write-only metrics destination. Exporter formatting lives elsewhere.
pub trait MetricsSink: Send + Sync {
    fn record_processed(&self, queue: &str, success: bool);

    fn observe_processing_time(&self, queue: &str, processing_time_ms: f64);

    fn set_queue_depth(&self, queue: &str, depth: u64);

    fn set_circuit_state(&self, queue: &str, state: CircuitState);
}

#[derive(Debug, Default, Clone)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_processed(&self, _queue: &str, _success: bool) {}

    fn observe_processing_time(&self, _queue: &str, _processing_time_ms: f64) {}

    fn set_queue_depth(&self, _queue: &str, _depth: u64) {}

    fn set_circuit_state(&self, _queue: &str, _state: CircuitState) {}
}

/// Emits every sample as a `tracing` event under the `metrics` target, so a
/// subscriber layer can forward them to an exporter.
#[derive(Debug, Default, Clone)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn record_processed(&self, queue: &str, success: bool) {
        debug!(
            target: "metrics",
            queue,
            success,
            counter = "notifications_processed_total",
            "metric"
        );
    }

    fn observe_processing_time(&self, queue: &str, processing_time_ms: f64) {
        debug!(
            target: "metrics",
            queue,
            histogram = "notification_processing_duration_ms",
            value = processing_time_ms,
            "metric"
        );
    }

    fn set_queue_depth(&self, queue: &str, depth: u64) {
        debug!(target: "metrics", queue, gauge = "queue_depth", value = depth, "metric");
    }

    fn set_circuit_state(&self, queue: &str, state: CircuitState) {
        debug!(
            target: "metrics",
            queue,
            gauge = "circuit_breaker_state",
            state = state.as_str(),
            value = state.as_gauge(),
            "metric"
        );
    }
}
