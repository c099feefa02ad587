use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::{
    clients::{circuit_breaker::CircuitBreaker, metrics::MetricsSink},
    error::{DispatchError, Result},
    models::{
        circuit_breaker::{CircuitBreakerConfig, CircuitState},
        metrics::{OverallMetrics, QueueMetrics},
        status::{Alert, AlertKind, AlertSeverity, QueueStatus},
    },
};

/// Below this success rate a degraded queue is reported as critical.
const CRITICAL_SUCCESS_RATE: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct AlertThresholds {
    pub queue_length_warning: u64,
    pub queue_length_critical: u64,
    pub min_success_rate: f64,
    /// Success-rate alerts stay quiet until a queue has processed this many
    /// messages.
    pub min_samples: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            queue_length_warning: 1000,
            queue_length_critical: 5000,
            min_success_rate: 0.95,
            min_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MonitorConfig {
    pub circuit_breaker: CircuitBreakerConfig,
    pub alerts: AlertThresholds,
}

struct QueueHealth {
    breaker: CircuitBreaker,
    metrics: QueueMetrics,
}

/// Rolling per-queue metrics and circuit breakers.
///
/// Each queue's breaker and metrics live behind the same map entry, so a
/// recorded outcome updates both atomically while other queues stay
/// unblocked.
pub struct QueueHealthMonitor {
    queues: DashMap<String, QueueHealth>,
    config: MonitorConfig,
    metrics_sink: Arc<dyn MetricsSink>,
}

impl QueueHealthMonitor {
    pub fn new<I, S>(
        queue_names: I,
        config: MonitorConfig,
        metrics_sink: Arc<dyn MetricsSink>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let monitor = Self {
            queues: DashMap::new(),
            config,
            metrics_sink,
        };

        for name in queue_names {
            monitor.register_queue(name);
        }

        monitor
    }

    /// Starts tracking `name` with a closed breaker. Registering a known
    /// queue again leaves its state untouched.
    pub fn register_queue(&self, name: impl Into<String>) {
        let name = name.into();
        self.queues.entry(name.clone()).or_insert_with(|| {
            info!(queue = %name, "Queue health tracking initialized");
            QueueHealth {
                breaker: CircuitBreaker::new(name.clone(), self.config.circuit_breaker.clone()),
                metrics: QueueMetrics::default(),
            }
        });
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Records one processed message. Queues seen for the first time are
    /// registered on the fly.
    pub fn record_message_processed(&self, queue: &str, processing_time_ms: f64, success: bool) {
        let now = Utc::now();

        let circuit_state = {
            let mut entry = self.queues.entry(queue.to_string()).or_insert_with(|| QueueHealth {
                breaker: CircuitBreaker::new(queue, self.config.circuit_breaker.clone()),
                metrics: QueueMetrics::default(),
            });

            entry.metrics.record(processing_time_ms, success, now);
            entry.breaker.record(success, now);
            entry.breaker.state()
        };

        debug!(
            queue,
            processing_time_ms,
            success,
            circuit_state = circuit_state.as_str(),
            "Message outcome recorded"
        );

        self.metrics_sink.record_processed(queue, success);
        self.metrics_sink
            .observe_processing_time(queue, processing_time_ms);
        self.metrics_sink.set_circuit_state(queue, circuit_state);
    }

    pub fn record_queue_length(&self, queue: &str, length: u64) {
        if let Some(mut entry) = self.queues.get_mut(queue) {
            entry.metrics.queue_length = length;
        }
        self.metrics_sink.set_queue_depth(queue, length);
    }

    pub fn get_queue_status(&self, name: &str) -> Result<QueueStatus> {
        let entry = self
            .queues
            .get(name)
            .ok_or_else(|| DispatchError::UnknownQueue(name.to_string()))?;

        Ok(self.build_status(name, &entry))
    }

    pub fn get_all_queues_status(&self) -> Vec<QueueStatus> {
        let mut statuses: Vec<QueueStatus> = self
            .queues
            .iter()
            .map(|entry| self.build_status(entry.key(), entry.value()))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    pub fn get_queue_metrics(&self, name: &str) -> Result<QueueMetrics> {
        self.queues
            .get(name)
            .map(|entry| entry.metrics.clone())
            .ok_or_else(|| DispatchError::UnknownQueue(name.to_string()))
    }

    pub fn get_overall_metrics(&self) -> OverallMetrics {
        let mut total_processed = 0u64;
        let mut total_failed = 0u64;
        let mut total_queue_length = 0u64;
        let mut weighted_time = 0.0;
        let mut open_circuits = 0;
        let mut half_open_circuits = 0;

        for entry in self.queues.iter() {
            let metrics = &entry.metrics;
            total_processed += metrics.total_processed;
            total_failed += metrics.total_failed;
            total_queue_length += metrics.queue_length;
            weighted_time += metrics.average_processing_time * metrics.total_processed as f64;

            match entry.breaker.state() {
                CircuitState::Open => open_circuits += 1,
                CircuitState::HalfOpen => half_open_circuits += 1,
                CircuitState::Closed => {}
            }
        }

        let (success_rate, average_processing_time) = if total_processed == 0 {
            (1.0, 0.0)
        } else {
            (
                (total_processed - total_failed) as f64 / total_processed as f64,
                weighted_time / total_processed as f64,
            )
        };

        OverallMetrics {
            total_queues: self.queues.len(),
            total_processed,
            total_failed,
            success_rate,
            average_processing_time,
            total_queue_length,
            open_circuits,
            half_open_circuits,
            timestamp: Utc::now(),
        }
    }

    pub fn get_alerts(&self) -> Vec<Alert> {
        let thresholds = &self.config.alerts;
        let now = Utc::now();
        let mut alerts = Vec::new();

        for name in self.queue_names() {
            let Some(entry) = self.queues.get(&name) else {
                continue;
            };
            let metrics = &entry.metrics;

            if metrics.queue_length > thresholds.queue_length_critical {
                alerts.push(Alert {
                    queue: name.clone(),
                    kind: AlertKind::QueueLength,
                    severity: AlertSeverity::Critical,
                    message: format!(
                        "Queue length {} exceeds critical threshold {}",
                        metrics.queue_length, thresholds.queue_length_critical
                    ),
                    timestamp: now,
                });
            } else if metrics.queue_length > thresholds.queue_length_warning {
                alerts.push(Alert {
                    queue: name.clone(),
                    kind: AlertKind::QueueLength,
                    severity: AlertSeverity::Warning,
                    message: format!(
                        "Queue length {} exceeds warning threshold {}",
                        metrics.queue_length, thresholds.queue_length_warning
                    ),
                    timestamp: now,
                });
            }

            let success_rate = metrics.success_rate();
            if metrics.total_processed >= thresholds.min_samples
                && success_rate < thresholds.min_success_rate
            {
                let severity = if success_rate < CRITICAL_SUCCESS_RATE {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Warning
                };
                alerts.push(Alert {
                    queue: name.clone(),
                    kind: AlertKind::SuccessRate,
                    severity,
                    message: format!(
                        "Success rate {:.1}% is below {:.1}%",
                        success_rate * 100.0,
                        thresholds.min_success_rate * 100.0
                    ),
                    timestamp: now,
                });
            }

            let severity = match entry.breaker.state() {
                CircuitState::Closed => None,
                CircuitState::HalfOpen => Some(AlertSeverity::Warning),
                CircuitState::Open => Some(AlertSeverity::Critical),
            };
            if let Some(severity) = severity {
                alerts.push(Alert {
                    queue: name.clone(),
                    kind: AlertKind::CircuitBreaker,
                    severity,
                    message: format!("Circuit breaker is {}", entry.breaker.state().as_str()),
                    timestamp: now,
                });
            }
        }

        alerts
    }

    pub fn reset_circuit_breaker(&self, name: &str) -> Result<()> {
        let mut entry = self
            .queues
            .get_mut(name)
            .ok_or_else(|| DispatchError::UnknownQueue(name.to_string()))?;

        entry.breaker.reset();
        let state = entry.breaker.state();
        drop(entry);

        self.metrics_sink.set_circuit_state(name, state);
        Ok(())
    }

    fn build_status(&self, name: &str, health: &QueueHealth) -> QueueStatus {
        let thresholds = &self.config.alerts;
        let breaker = health.breaker.snapshot();
        let success_rate = health.metrics.success_rate();

        let rate_ok = health.metrics.total_processed < thresholds.min_samples
            || success_rate >= thresholds.min_success_rate;
        let healthy = breaker.state == CircuitState::Closed
            && rate_ok
            && health.metrics.queue_length <= thresholds.queue_length_warning;

        QueueStatus {
            name: name.to_string(),
            circuit_breaker_state: breaker.state,
            circuit_breaker: breaker,
            metrics: health.metrics.clone(),
            success_rate,
            healthy,
        }
    }
}
