//! Batch ingestion: deduplication, priority grouping and chunked publish.

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    clients::broker::TtlStore,
    dispatcher::PriorityDispatcher,
    error::{DispatchError, Result},
    models::{
        batch::{BatchResult, BatchStats},
        message::{NotificationMessage, Priority},
    },
};

const DEDUP_KEY_PREFIX: &str = "notification:dedup";

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    /// Largest batch `process_batch` accepts.
    pub max_batch_size: usize,
    /// Messages published concurrently per chunk.
    pub batch_size: usize,
    pub deduplication_ttl_seconds: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1000,
            batch_size: 100,
            deduplication_ttl_seconds: 3600,
        }
    }
}

pub struct BatchIngestor {
    dispatcher: Arc<PriorityDispatcher>,
    dedup_store: Arc<dyn TtlStore>,
    config: IngestionConfig,
    stats: Mutex<BatchStats>,
}

impl BatchIngestor {
    pub fn new(
        dispatcher: Arc<PriorityDispatcher>,
        dedup_store: Arc<dyn TtlStore>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            dispatcher,
            dedup_store,
            config,
            stats: Mutex::new(BatchStats::default()),
        }
    }

    /// Deduplicates `messages`, groups the rest by priority and publishes them
    /// in chunks. A failed publish only counts against its own message.
    pub async fn process_batch(&self, messages: Vec<NotificationMessage>) -> Result<BatchResult> {
        if messages.is_empty() {
            return Err(DispatchError::EmptyBatch);
        }
        if messages.len() > self.config.max_batch_size {
            return Err(DispatchError::BatchTooLarge {
                size: messages.len(),
                max: self.config.max_batch_size,
            });
        }

        let started = Instant::now();
        let batch_id = Uuid::new_v4().to_string();
        let total_processed = messages.len();

        let mut duplicates = 0;
        let mut groups: BTreeMap<Priority, Vec<NotificationMessage>> = BTreeMap::new();

        for mut message in messages {
            let key = message.effective_deduplication_key();
            message.deduplication_key = Some(key.clone());
            message.batch_id = Some(batch_id.clone());

            if self.is_duplicate(&key, &message.id).await {
                duplicates += 1;
                continue;
            }

            groups.entry(message.priority).or_default().push(message);
        }

        let mut successful = 0;
        let mut failed = 0;
        let chunk_size = self.config.batch_size.max(1);

        for (priority, group) in &groups {
            for chunk in group.chunks(chunk_size) {
                let results = join_all(
                    chunk
                        .iter()
                        .map(|message| self.dispatcher.enqueue_notification(message)),
                )
                .await;

                for (message, result) in chunk.iter().zip(results) {
                    match result {
                        Ok(()) => successful += 1,
                        Err(e) => {
                            failed += 1;
                            warn!(
                                batch_id = %batch_id,
                                message_id = %message.id,
                                error = %e,
                                "Failed to publish batch message"
                            );
                        }
                    }
                }

                debug!(
                    batch_id = %batch_id,
                    priority = %priority,
                    chunk_size = chunk.len(),
                    "Batch chunk published"
                );
            }
        }

        let result = BatchResult {
            batch_id,
            total_processed,
            successful,
            failed,
            duplicates,
            processing_time: started.elapsed().as_millis() as u64,
        };

        self.stats.lock().await.record(&result);

        info!(
            batch_id = %result.batch_id,
            total = result.total_processed,
            successful = result.successful,
            failed = result.failed,
            duplicates = result.duplicates,
            processing_time_ms = result.processing_time,
            "Batch processed"
        );

        Ok(result)
    }

    pub async fn stats(&self) -> BatchStats {
        self.stats.lock().await.clone()
    }

    pub async fn reset_stats(&self) {
        *self.stats.lock().await = BatchStats::default();
    }

    /// Checks the deduplication window and claims `key` when it is free.
    /// Store failures let the message through.
    async fn is_duplicate(&self, key: &str, message_id: &str) -> bool {
        let store_key = format!("{}:{}", DEDUP_KEY_PREFIX, key);

        match self.dedup_store.get(&store_key).await {
            Ok(Some(original_id)) => {
                debug!(
                    message_id,
                    original_id = %original_id,
                    "Duplicate notification suppressed"
                );
                true
            }
            Ok(None) => {
                if let Err(e) = self
                    .dedup_store
                    .set_with_ttl(&store_key, message_id, self.config.deduplication_ttl_seconds)
                    .await
                {
                    warn!(message_id, error = %e, "Failed to record deduplication key");
                }
                false
            }
            Err(e) => {
                warn!(
                    message_id,
                    error = %e,
                    "Deduplication lookup failed, accepting message"
                );
                false
            }
        }
    }
}
