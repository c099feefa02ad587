use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::anyhow;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clients::{
        broker::{BrokerChannel, Delivery, DeliveryStream, PublishOptions},
        delivery::Deliverer,
        health::QueueHealthMonitor,
    },
    dispatcher::QueueTopology,
    error::{DispatchError, Result},
    models::message::{DlqMessage, NotificationMessage},
};

/// Terminal state of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    /// Delivered and acknowledged.
    Acknowledged,
    /// Copied to the retry queue with `retry_count + 1`, original acked.
    Retried,
    /// Moved to the dead-letter queue, original acked.
    DeadLettered,
    /// Nacked without requeue.
    Rejected,
}

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) channel: Box<dyn BrokerChannel>,
    pub(crate) deliverer: Arc<dyn Deliverer>,
    pub(crate) monitor: Arc<QueueHealthMonitor>,
    pub(crate) topology: QueueTopology,
    pub(crate) delivery_timeout: Option<Duration>,
    pub(crate) busy: Arc<AtomicBool>,
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

impl Worker {
    pub(crate) async fn run(self, mut deliveries: DeliveryStream, shutdown: CancellationToken) {
        info!(worker_id = self.id, "Worker started");

        loop {
            // Cancellation is only observed between messages, so an in-flight
            // message always reaches its ack/retry/dead-letter decision.
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.busy.store(true, Ordering::Release);
                    let outcome = self.process(delivery).await;
                    self.busy.store(false, Ordering::Release);
                    debug!(worker_id = self.id, ?outcome, "Delivery settled");
                }
                Some(Err(e)) => {
                    error!(worker_id = self.id, error = %e, "Consumer stream failed");
                    break;
                }
                None => break,
            }
        }

        drop(deliveries);

        if let Err(e) = self.channel.close().await {
            warn!(worker_id = self.id, error = %e, "Failed to close worker channel");
        }

        info!(worker_id = self.id, "Worker stopped");
    }

    pub(crate) async fn process(&self, delivery: Delivery) -> ProcessingOutcome {
        let started = Instant::now();

        let message = match serde_json::from_slice::<NotificationMessage>(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                let err = DispatchError::MalformedMessage(e.to_string());
                warn!(
                    worker_id = self.id,
                    queue = %delivery.queue,
                    kind = ?err.kind(),
                    error = %err,
                    "Rejecting malformed message"
                );
                self.reject(&delivery).await;
                return ProcessingOutcome::Rejected;
            }
        };

        debug!(
            worker_id = self.id,
            queue = %delivery.queue,
            message_id = %message.id,
            retry_count = message.retry_count,
            "Processing notification"
        );

        match self.deliver(&message).await {
            Ok(()) => {
                if let Err(e) = self.channel.ack(delivery.delivery_tag).await {
                    error!(
                        message_id = %message.id,
                        error = %e,
                        "Delivered but failed to acknowledge; broker may redeliver"
                    );
                }
                self.monitor
                    .record_message_processed(&delivery.queue, elapsed_ms(started), true);

                info!(
                    worker_id = self.id,
                    message_id = %message.id,
                    "Notification delivered"
                );
                ProcessingOutcome::Acknowledged
            }
            Err(reason) => {
                let message_id = message.id.clone();
                let outcome = match self.handle_message_failure(&delivery, message, &reason).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(
                            worker_id = self.id,
                            queue = %delivery.queue,
                            message_id = %message_id,
                            delivery_error = %reason,
                            error = %e,
                            "Failed to move message after delivery failure; rejecting, message may be lost"
                        );
                        self.reject(&delivery).await;
                        ProcessingOutcome::Rejected
                    }
                };

                self.monitor
                    .record_message_processed(&delivery.queue, elapsed_ms(started), false);
                outcome
            }
        }
    }

    async fn deliver(&self, message: &NotificationMessage) -> anyhow::Result<()> {
        match self.delivery_timeout {
            Some(limit) => tokio::time::timeout(limit, self.deliverer.deliver(message))
                .await
                .map_err(|_| anyhow!("Delivery timed out after {} ms", limit.as_millis()))?,
            None => self.deliverer.deliver(message).await,
        }
    }

    /// Moves a failed message to the retry queue, or to the dead-letter queue
    /// once its retry budget is spent, then acks the original.
    async fn handle_message_failure(
        &self,
        delivery: &Delivery,
        mut message: NotificationMessage,
        reason: &anyhow::Error,
    ) -> Result<ProcessingOutcome> {
        let exhausted = message.record_failed_attempt();
        let options = PublishOptions::persistent(message.priority.broker_priority());

        if !exhausted {
            let failure = DispatchError::TransientDelivery(reason.to_string());
            let payload = serde_json::to_vec(&message)?;
            self.channel
                .publish(&self.topology.retry, &payload, options)
                .await?;
            self.channel.ack(delivery.delivery_tag).await?;

            warn!(
                message_id = %message.id,
                retry_count = message.retry_count,
                max_retries = message.max_retries,
                kind = ?failure.kind(),
                error = %failure,
                "Message scheduled for retry"
            );
            return Ok(ProcessingOutcome::Retried);
        }

        let failure = DispatchError::TerminalDelivery {
            attempts: message.retry_count,
            reason: reason.to_string(),
        };
        let message_id = message.id.clone();
        let dead_letter = DlqMessage::new(message, reason.to_string());
        let payload = serde_json::to_vec(&dead_letter)?;

        self.channel
            .publish(&self.topology.dead_letter, &payload, options)
            .await?;
        self.channel.ack(delivery.delivery_tag).await?;

        warn!(
            message_id = %message_id,
            kind = ?failure.kind(),
            error = %failure,
            "Message moved to dead-letter queue"
        );

        Ok(ProcessingOutcome::DeadLettered)
    }

    async fn reject(&self, delivery: &Delivery) {
        if let Err(e) = self.channel.nack(delivery.delivery_tag, false).await {
            error!(
                worker_id = self.id,
                delivery_tag = delivery.delivery_tag,
                error = %e,
                "Failed to reject message"
            );
        }
    }
}
