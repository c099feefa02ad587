use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::models::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerState, CircuitState};

/// Per-queue breaker driven purely by observed outcomes.
///
/// There is no timer: an open breaker only moves to half-open when the next
/// success for its queue is recorded. `next_attempt_time` is advisory.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    queue_name: String,
    config: CircuitBreakerConfig,
    state: CircuitBreakerState,
}

impl CircuitBreaker {
    pub fn new(queue_name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let state = CircuitBreakerState::closed(&config);
        Self {
            queue_name: queue_name.into(),
            config,
            state,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.state
    }

    pub fn snapshot(&self) -> CircuitBreakerState {
        self.state.clone()
    }

    pub fn record(&mut self, success: bool, now: DateTime<Utc>) {
        if success {
            self.record_success(now);
        } else {
            self.record_failure(now);
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        match self.state.state {
            CircuitState::Closed => {}
            CircuitState::Open => {
                self.transition(CircuitState::HalfOpen);
                self.state.success_count = 1;
                self.state.next_attempt_time =
                    Some(now + seconds(self.config.half_open_timeout_seconds));
                info!(queue = %self.queue_name, "Circuit breaker half-open after success");

                // A threshold of one closes on the first success.
                if self.state.success_count >= self.config.success_threshold {
                    self.close();
                }
            }
            CircuitState::HalfOpen => {
                let successes = self.state.success_count + 1;
                debug!(
                    queue = %self.queue_name,
                    successes,
                    threshold = self.config.success_threshold,
                    "Circuit breaker success recorded"
                );

                if successes >= self.config.success_threshold {
                    self.close();
                } else {
                    self.state.success_count = successes;
                }
            }
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.state.last_failure_time = Some(now);

        match self.state.state {
            CircuitState::Closed => {
                let failures = self.state.failure_count + 1;
                debug!(
                    queue = %self.queue_name,
                    failures,
                    threshold = self.config.failure_threshold,
                    "Circuit breaker failure recorded"
                );

                if failures >= self.config.failure_threshold {
                    self.open(now);
                    warn!(
                        queue = %self.queue_name,
                        failures,
                        "Circuit breaker opened due to failures"
                    );
                } else {
                    self.state.failure_count = failures;
                }
            }
            CircuitState::Open => {}
            CircuitState::HalfOpen => {
                self.open(now);
                warn!(
                    queue = %self.queue_name,
                    "Circuit breaker reopened after failed recovery"
                );
            }
        }
    }

    /// Forces the breaker closed and clears all bookkeeping.
    pub fn reset(&mut self) {
        self.transition(CircuitState::Closed);
        self.state.last_failure_time = None;
        self.state.next_attempt_time = None;
        info!(queue = %self.queue_name, "Circuit breaker manually reset");
    }

    fn open(&mut self, now: DateTime<Utc>) {
        self.transition(CircuitState::Open);
        self.state.next_attempt_time = Some(now + seconds(self.config.open_timeout_seconds));
    }

    fn close(&mut self) {
        self.transition(CircuitState::Closed);
        self.state.next_attempt_time = None;
        info!(queue = %self.queue_name, "Circuit breaker closed after recovery");
    }

    // Both counters reset on every state change.
    fn transition(&mut self, next: CircuitState) {
        self.state.state = next;
        self.state.failure_count = 0;
        self.state.success_count = 0;
    }
}

fn seconds(value: u64) -> Duration {
    Duration::seconds(value.min(u64::from(u32::MAX)) as i64)
}
