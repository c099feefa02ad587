use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::{
    clients::health::{AlertThresholds, MonitorConfig},
    dispatcher::{DispatcherConfig, QueueTopology},
    ingestion::IngestionConfig,
    models::{circuit_breaker::CircuitBreakerConfig, retry::RetryConfig},
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    pub redis_url: String,

    #[serde(default = "default_main_queue_name")]
    pub main_queue_name: String,
    #[serde(default = "default_retry_queue_name")]
    pub retry_queue_name: String,
    #[serde(default = "default_dead_letter_queue_name")]
    pub dead_letter_queue_name: String,
    #[serde(default = "default_max_priority")]
    pub max_priority: u8,
    #[serde(default = "default_dead_letter_ttl_ms")]
    pub dead_letter_ttl_ms: u64,

    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    pub delivery_timeout_ms: Option<u64>,
    pub delivery_webhook_url: Option<String>,

    #[serde(default = "default_snapshot_interval_seconds")]
    pub snapshot_interval_seconds: u64,
    #[serde(default = "default_snapshot_ttl_seconds")]
    pub snapshot_ttl_seconds: u64,
    #[serde(default = "default_snapshot_key")]
    pub snapshot_key: String,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_deduplication_ttl_seconds")]
    pub deduplication_ttl_seconds: u64,

    #[serde(default = "default_failure_threshold")]
    pub circuit_breaker_failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub circuit_breaker_success_threshold: u32,
    #[serde(default = "default_open_timeout_seconds")]
    pub circuit_breaker_open_timeout_seconds: u64,
    #[serde(default = "default_half_open_timeout_seconds")]
    pub circuit_breaker_half_open_timeout_seconds: u64,

    #[serde(default = "default_queue_length_warning")]
    pub alert_queue_length_warning: u64,
    #[serde(default = "default_queue_length_critical")]
    pub alert_queue_length_critical: u64,
    #[serde(default = "default_min_success_rate")]
    pub alert_min_success_rate: f64,
    #[serde(default = "default_min_samples")]
    pub alert_min_samples: u64,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_log_json")]
    pub log_json: bool,
}

fn default_main_queue_name() -> String {
    "notifications.main".to_string()
}

fn default_retry_queue_name() -> String {
    "notifications.retry".to_string()
}

fn default_dead_letter_queue_name() -> String {
    "notifications.dead_letter".to_string()
}

fn default_max_priority() -> u8 {
    15
}

fn default_dead_letter_ttl_ms() -> u64 {
    24 * 60 * 60 * 1000
}

fn default_worker_count() -> usize {
    5
}

fn default_snapshot_interval_seconds() -> u64 {
    30
}

fn default_snapshot_ttl_seconds() -> u64 {
    24 * 60 * 60
}

fn default_snapshot_key() -> String {
    "dispatcher:state".to_string()
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_batch_size() -> usize {
    100
}

fn default_deduplication_ttl_seconds() -> u64 {
    3600
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    3
}

fn default_open_timeout_seconds() -> u64 {
    60
}

fn default_half_open_timeout_seconds() -> u64 {
    30
}

fn default_queue_length_warning() -> u64 {
    1000
}

fn default_queue_length_critical() -> u64 {
    5000
}

fn default_min_success_rate() -> f64 {
    0.95
}

fn default_min_samples() -> u64 {
    10
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_initial_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    10_000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_log_json() -> bool {
    true
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environmental variable: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.worker_count == 0 {
            return Err(anyhow!("WORKER_COUNT must be at least 1"));
        }
        if self.batch_size == 0 || self.max_batch_size == 0 {
            return Err(anyhow!("BATCH_SIZE and MAX_BATCH_SIZE must be at least 1"));
        }
        if self.snapshot_interval_seconds == 0 {
            return Err(anyhow!("SNAPSHOT_INTERVAL_SECONDS must be at least 1"));
        }
        if self.max_priority > 15 {
            return Err(anyhow!("MAX_PRIORITY must be within 0-15"));
        }
        if self.circuit_breaker_failure_threshold == 0
            || self.circuit_breaker_success_threshold == 0
        {
            return Err(anyhow!("Circuit breaker thresholds must be at least 1"));
        }
        Ok(())
    }

    pub fn topology(&self) -> QueueTopology {
        QueueTopology {
            main: self.main_queue_name.clone(),
            retry: self.retry_queue_name.clone(),
            dead_letter: self.dead_letter_queue_name.clone(),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            topology: self.topology(),
            max_priority: self.max_priority,
            dead_letter_ttl: Duration::from_millis(self.dead_letter_ttl_ms),
            worker_count: self.worker_count,
            delivery_timeout: self.delivery_timeout_ms.map(Duration::from_millis),
            snapshot_interval: Duration::from_secs(self.snapshot_interval_seconds),
            snapshot_ttl_seconds: self.snapshot_ttl_seconds,
            snapshot_key: self.snapshot_key.clone(),
        }
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            max_batch_size: self.max_batch_size,
            batch_size: self.batch_size,
            deduplication_ttl_seconds: self.deduplication_ttl_seconds,
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            circuit_breaker: self.circuit_breaker_config(),
            alerts: AlertThresholds {
                queue_length_warning: self.alert_queue_length_warning,
                queue_length_critical: self.alert_queue_length_critical,
                min_success_rate: self.alert_min_success_rate,
                min_samples: self.alert_min_samples,
            },
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_failure_threshold,
            success_threshold: self.circuit_breaker_success_threshold,
            open_timeout_seconds: self.circuit_breaker_open_timeout_seconds,
            half_open_timeout_seconds: self.circuit_breaker_half_open_timeout_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Config {
        let vars = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()));
        envy::from_iter::<_, Config>(vars).unwrap()
    }

    #[test]
    fn test_defaults_apply() {
        let config = from_pairs(&[
            ("RABBITMQ_URL", "amqp://localhost:5672"),
            ("REDIS_URL", "redis://localhost:6379"),
        ]);

        assert_eq!(config.worker_count, 5);
        assert_eq!(config.max_batch_size, 1000);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.deduplication_ttl_seconds, 3600);
        assert_eq!(config.snapshot_interval_seconds, 30);
        assert!(config.delivery_timeout_ms.is_none());
        assert!(config.validate().is_ok());

        let breaker = config.circuit_breaker_config();
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.success_threshold, 3);
    }

    #[test]
    fn test_overrides_apply() {
        let config = from_pairs(&[
            ("RABBITMQ_URL", "amqp://localhost:5672"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("WORKER_COUNT", "8"),
            ("DELIVERY_TIMEOUT_MS", "2500"),
            ("MAIN_QUEUE_NAME", "push.main"),
        ]);

        let dispatcher = config.dispatcher_config();
        assert_eq!(dispatcher.worker_count, 8);
        assert_eq!(
            dispatcher.delivery_timeout,
            Some(Duration::from_millis(2500))
        );
        assert_eq!(dispatcher.topology.main, "push.main");
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = from_pairs(&[
            ("RABBITMQ_URL", "amqp://localhost:5672"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("WORKER_COUNT", "0"),
        ]);

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_snapshot_interval_rejected() {
        let config = from_pairs(&[
            ("RABBITMQ_URL", "amqp://localhost:5672"),
            ("REDIS_URL", "redis://localhost:6379"),
            ("SNAPSHOT_INTERVAL_SECONDS", "0"),
        ]);

        assert!(config.validate().is_err());
    }
}
