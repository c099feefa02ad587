use serde::{Deserialize, Serialize};

/// Outcome of one `process_batch` call.
///
/// `successful + failed + duplicates == total_processed` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub batch_id: String,
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub duplicates: usize,
    /// Wall-clock time spent on the batch, in milliseconds.
    pub processing_time: u64,
}

/// Rolling aggregate over every batch seen by an ingestor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub total_batches: u64,
    pub total_notifications: u64,
    pub success_rate: f64,
    pub average_batch_size: f64,
    pub average_processing_time: f64,
}

impl BatchStats {
    pub fn record(&mut self, result: &BatchResult) {
        self.total_batches += 1;
        self.total_notifications += result.total_processed as u64;

        let n = self.total_batches as f64;
        let batch_success_rate = if result.total_processed == 0 {
            0.0
        } else {
            result.successful as f64 / result.total_processed as f64
        };

        self.success_rate = incremental_mean(self.success_rate, batch_success_rate, n);
        self.average_batch_size =
            incremental_mean(self.average_batch_size, result.total_processed as f64, n);
        self.average_processing_time =
            incremental_mean(self.average_processing_time, result.processing_time as f64, n);
    }
}

fn incremental_mean(old: f64, value: f64, n: f64) -> f64 {
    (old * (n - 1.0) + value) / n
}
