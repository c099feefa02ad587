//! Seams between the dispatcher and the infrastructure it runs on.
//!
//! The RabbitMQ and Redis clients implement these for production; the
//! in-memory versions in [`crate::clients::memory`] back tests and local runs.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::{error::Result, models::status::QueueDepth};

/// Per-publish options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    pub priority: u8,
    pub persistent: bool,
}

impl PublishOptions {
    pub fn persistent(priority: u8) -> Self {
        Self {
            priority,
            persistent: true,
        }
    }
}

/// Queue declaration arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub max_priority: u8,
    pub message_ttl: Option<Duration>,
}

/// A message handed to a consumer. Must be acked or nacked on the channel
/// that received it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub data: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares a durable queue. Idempotent.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()>;

    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()>;

    async fn queue_depth(&self, name: &str) -> Result<QueueDepth>;

    /// Opens a dedicated channel with the given prefetch limit.
    async fn open_channel(&self, prefetch: u16) -> Result<Box<dyn BrokerChannel>>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Publishes on this channel; used for retry and dead-letter moves so the
    /// move and the ack of the original travel together.
    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()>;

    /// Closes the channel. Unacknowledged deliveries return to their queue.
    async fn close(&self) -> Result<()>;
}

/// Key-value store with per-key expiry. Backs both the deduplication window
/// and the dispatcher snapshot.
#[async_trait]
pub trait TtlStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()>;
}
