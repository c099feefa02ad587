use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMetrics {
    pub total_processed: u64,
    pub total_failed: u64,
    /// Running mean over every processed message, in milliseconds.
    pub average_processing_time: f64,
    /// Depth last reported by the broker.
    pub queue_length: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

impl QueueMetrics {
    pub fn record(&mut self, processing_time_ms: f64, success: bool, at: DateTime<Utc>) {
        self.total_processed += 1;
        if !success {
            self.total_failed += 1;
        }

        let n = self.total_processed as f64;
        self.average_processing_time =
            (self.average_processing_time * (n - 1.0) + processing_time_ms) / n;
        self.last_processed_at = Some(at);
    }

    /// Share of processed messages that succeeded; 1.0 before any traffic.
    pub fn success_rate(&self) -> f64 {
        if self.total_processed == 0 {
            return 1.0;
        }
        (self.total_processed - self.total_failed) as f64 / self.total_processed as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallMetrics {
    pub total_queues: usize,
    pub total_processed: u64,
    pub total_failed: u64,
    pub success_rate: f64,
    pub average_processing_time: f64,
    pub total_queue_length: u64,
    pub open_circuits: usize,
    pub half_open_circuits: usize,
    pub timestamp: DateTime<Utc>,
}
