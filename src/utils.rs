use sha2::{Digest, Sha256};
use tokio::time::{Duration, sleep};
use tracing::{debug, info, warn};

use crate::models::retry::RetryConfig;

/// Stable key for the logical content of a notification. Two requests with
/// the same user, type, title and body map to the same key.
pub fn derive_deduplication_key(
    user_id: &str,
    notification_type: &str,
    title: &str,
    body: &str,
) -> String {
    let mut hasher = Sha256::new();
    for part in [user_id, notification_type, title, body] {
        hasher.update(part.as_bytes());
        // Field separator so ("ab", "c") and ("a", "bc") differ.
        hasher.update([0u8]);
    }

    hex::encode(hasher.finalize())
}

pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay_ms = config.initial_delay_ms;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Retry succeeded");
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        operation = operation_name,
                        max_attempts = config.max_attempts,
                        error = %e,
                        "Giving up after exhausting all attempts"
                    );
                    return Err(e);
                }

                debug!(
                    operation = operation_name,
                    attempt,
                    delay_ms,
                    error = %e,
                    "Attempt failed, backing off"
                );

                let jitter = rand::random_range(-0.1..=0.1);
                let jittered_delay = (delay_ms as f64 * (1.0 + jitter)) as u64;

                sleep(Duration::from_millis(jittered_delay)).await;

                delay_ms = std::cmp::min(
                    delay_ms.saturating_mul(config.backoff_multiplier),
                    config.max_delay_ms,
                );
            }
        }
    }
}
