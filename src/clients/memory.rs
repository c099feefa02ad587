//! In-process broker and store.
//!
//! The broker keeps each queue as a priority heap and honours per-channel
//! prefetch, acks, nacks and message TTL, which is enough to run the whole
//! dispatch pipeline without RabbitMQ or Redis.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::{StreamExt, stream};
use tokio::sync::{Mutex, Notify};

use crate::{
    clients::broker::{
        Broker, BrokerChannel, Delivery, DeliveryStream, PublishOptions, QueueOptions, TtlStore,
    },
    error::{DispatchError, Result},
    models::status::QueueDepth,
};

#[derive(Debug, Clone)]
struct QueuedMessage {
    priority: u8,
    sequence: u64,
    data: Vec<u8>,
    expires_at: Option<Instant>,
}

impl QueuedMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    // Max-heap: higher priority first, then older first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct QueueState {
    options: QueueOptions,
    messages: BinaryHeap<QueuedMessage>,
    consumers: u32,
}

impl QueueState {
    fn purge_expired(&mut self, now: Instant) {
        if self.messages.iter().any(|m| m.is_expired(now)) {
            self.messages.retain(|m| !m.is_expired(now));
        }
    }
}

struct Unacked {
    channel_id: u64,
    queue: String,
    message: QueuedMessage,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    in_flight: HashMap<u64, usize>,
    subscriptions: HashMap<u64, Vec<String>>,
    closed_channels: HashSet<u64>,
    next_tag: u64,
    next_sequence: u64,
    next_channel: u64,
}

impl BrokerState {
    fn enqueue(&mut self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        self.next_sequence += 1;
        let sequence = self.next_sequence;

        let state = self
            .queues
            .get_mut(queue)
            .ok_or_else(|| DispatchError::Broker(format!("Queue {} is not declared", queue)))?;

        let priority = options.priority.min(state.options.max_priority);
        state.messages.push(QueuedMessage {
            priority,
            sequence,
            data: payload.to_vec(),
            expires_at: state.options.message_ttl.map(|ttl| Instant::now() + ttl),
        });

        Ok(())
    }

    fn take_next(&mut self, channel_id: u64, prefetch: usize, queue: &str) -> Option<Delivery> {
        let in_flight = self.in_flight.get(&channel_id).copied().unwrap_or(0);
        if in_flight >= prefetch {
            return None;
        }

        let now = Instant::now();
        let state = self.queues.get_mut(queue)?;
        let message = loop {
            let candidate = state.messages.pop()?;
            if !candidate.is_expired(now) {
                break candidate;
            }
        };

        self.next_tag += 1;
        let delivery_tag = self.next_tag;
        *self.in_flight.entry(channel_id).or_default() += 1;

        let data = message.data.clone();
        self.unacked.insert(
            delivery_tag,
            Unacked {
                channel_id,
                queue: queue.to_string(),
                message,
            },
        );

        Some(Delivery {
            delivery_tag,
            queue: queue.to_string(),
            data,
        })
    }

    fn settle(&mut self, channel_id: u64, delivery_tag: u64) -> Result<Unacked> {
        match self.unacked.get(&delivery_tag) {
            Some(entry) if entry.channel_id == channel_id => {}
            _ => {
                return Err(DispatchError::Broker(format!(
                    "Unknown delivery tag {}",
                    delivery_tag
                )));
            }
        }

        let entry = self
            .unacked
            .remove(&delivery_tag)
            .ok_or_else(|| DispatchError::Broker("Delivery already settled".to_string()))?;

        if let Some(count) = self.in_flight.get_mut(&channel_id) {
            *count = count.saturating_sub(1);
        }

        Ok(entry)
    }

    fn requeue(&mut self, entry: Unacked) {
        if let Some(state) = self.queues.get_mut(&entry.queue) {
            state.messages.push(entry.message);
        }
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Payloads currently waiting in `queue`, in the order they would be
    /// delivered.
    pub async fn queued_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.shared.state.lock().await;
        let Some(queue) = state.queues.get(queue) else {
            return Vec::new();
        };

        let now = Instant::now();
        let mut messages: Vec<QueuedMessage> = queue
            .messages
            .iter()
            .filter(|m| !m.is_expired(now))
            .cloned()
            .collect();
        messages.sort_by(|a, b| b.cmp(a));
        messages.into_iter().map(|m| m.data).collect()
    }

    /// Deliveries handed out but not yet acked or nacked.
    pub async fn unacked_count(&self) -> usize {
        self.shared.state.lock().await.unacked.len()
    }

    async fn publish_inner(
        &self,
        queue: &str,
        payload: &[u8],
        options: PublishOptions,
    ) -> Result<()> {
        self.shared
            .state
            .lock()
            .await
            .enqueue(queue, payload, options)?;
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| QueueState {
                options,
                messages: BinaryHeap::new(),
                consumers: 0,
            });
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        self.publish_inner(queue, payload, options).await
    }

    async fn queue_depth(&self, name: &str) -> Result<QueueDepth> {
        let mut state = self.shared.state.lock().await;
        let queue = state
            .queues
            .get_mut(name)
            .ok_or_else(|| DispatchError::Broker(format!("Queue {} is not declared", name)))?;

        queue.purge_expired(Instant::now());

        Ok(QueueDepth {
            message_count: queue.messages.len() as u32,
            consumer_count: queue.consumers,
        })
    }

    async fn open_channel(&self, prefetch: u16) -> Result<Box<dyn BrokerChannel>> {
        let mut state = self.shared.state.lock().await;
        state.next_channel += 1;
        let channel_id = state.next_channel;
        state.in_flight.insert(channel_id, 0);

        Ok(Box::new(InMemoryChannel {
            broker: self.clone(),
            channel_id,
            prefetch: usize::from(prefetch.max(1)),
        }))
    }
}

pub struct InMemoryChannel {
    broker: InMemoryBroker,
    channel_id: u64,
    prefetch: usize,
}

struct ConsumerCursor {
    shared: Arc<Shared>,
    channel_id: u64,
    prefetch: usize,
    queue: String,
}

async fn next_delivery(cursor: ConsumerCursor) -> Option<(Result<Delivery>, ConsumerCursor)> {
    let shared = Arc::clone(&cursor.shared);

    loop {
        // Register interest before inspecting state so a publish or ack that
        // lands in between is not missed.
        let notified = shared.notify.notified();

        {
            let mut state = shared.state.lock().await;
            if state.closed_channels.contains(&cursor.channel_id) {
                return None;
            }
            if let Some(delivery) =
                state.take_next(cursor.channel_id, cursor.prefetch, &cursor.queue)
            {
                return Some((Ok(delivery), cursor));
            }
        }

        notified.await;
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn consume(&self, queue: &str, _consumer_tag: &str) -> Result<DeliveryStream> {
        {
            let mut state = self.broker.shared.state.lock().await;
            let queue_state = state.queues.get_mut(queue).ok_or_else(|| {
                DispatchError::Broker(format!("Queue {} is not declared", queue))
            })?;
            queue_state.consumers += 1;
            state
                .subscriptions
                .entry(self.channel_id)
                .or_default()
                .push(queue.to_string());
        }

        let cursor = ConsumerCursor {
            shared: Arc::clone(&self.broker.shared),
            channel_id: self.channel_id,
            prefetch: self.prefetch,
            queue: queue.to_string(),
        };

        Ok(stream::unfold(cursor, next_delivery).boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.broker
            .shared
            .state
            .lock()
            .await
            .settle(self.channel_id, delivery_tag)?;
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        {
            let mut state = self.broker.shared.state.lock().await;
            let entry = state.settle(self.channel_id, delivery_tag)?;
            if requeue {
                state.requeue(entry);
            }
        }
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        self.broker.publish_inner(queue, payload, options).await
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.broker.shared.state.lock().await;
            if !state.closed_channels.insert(self.channel_id) {
                return Ok(());
            }

            let tags: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, entry)| entry.channel_id == self.channel_id)
                .map(|(tag, _)| *tag)
                .collect();
            for tag in tags {
                if let Some(entry) = state.unacked.remove(&tag) {
                    state.requeue(entry);
                }
            }
            state.in_flight.remove(&self.channel_id);

            for queue in state
                .subscriptions
                .remove(&self.channel_id)
                .unwrap_or_default()
            {
                if let Some(queue_state) = state.queues.get_mut(&queue) {
                    queue_state.consumers = queue_state.consumers.saturating_sub(1);
                }
            }
        }
        self.broker.shared.notify.notify_waiters();
        Ok(())
    }
}

struct StoredValue {
    value: String,
    expires_at: Instant,
}

/// Thread-safe TTL map implementing [`TtlStore`].
#[derive(Default)]
pub struct InMemoryStore {
    data: DashMap<String, StoredValue>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_with_duration(&self, key: &str, value: &str, ttl: Duration) {
        self.data.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        let entry = self.data.get(key)?;
        if entry.expires_at > Instant::now() {
            Some(entry.value.clone())
        } else {
            drop(entry);
            self.data
                .remove_if(key, |_, stored| stored.expires_at <= Instant::now());
            None
        }
    }

    /// Drops every expired entry.
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.data.retain(|_, entry| entry.expires_at > now);
    }

    /// Number of entries, including ones that expired but were not yet
    /// cleaned up.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait]
impl TtlStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lookup(key))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        self.set_with_duration(key, value, Duration::from_secs(ttl_seconds));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> QueueOptions {
        QueueOptions {
            max_priority: 15,
            message_ttl: None,
        }
    }

    #[tokio::test]
    async fn test_higher_priority_delivered_first() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", options()).await.unwrap();

        broker
            .publish("q", b"low", PublishOptions::persistent(1))
            .await
            .unwrap();
        broker
            .publish("q", b"urgent", PublishOptions::persistent(15))
            .await
            .unwrap();
        broker
            .publish("q", b"normal", PublishOptions::persistent(5))
            .await
            .unwrap();

        let payloads = broker.queued_payloads("q").await;
        assert_eq!(
            payloads,
            vec![b"urgent".to_vec(), b"normal".to_vec(), b"low".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_prefetch_limits_in_flight_deliveries() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", options()).await.unwrap();
        for payload in [b"a", b"b"] {
            broker
                .publish("q", payload, PublishOptions::persistent(5))
                .await
                .unwrap();
        }

        let channel = broker.open_channel(1).await.unwrap();
        let mut stream = channel.consume("q", "test").await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(second.is_err(), "second delivery must wait for an ack");

        channel.ack(first.delivery_tag).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.data, b"b".to_vec());
    }

    #[tokio::test]
    async fn test_nack_without_requeue_drops_message() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", options()).await.unwrap();
        broker
            .publish("q", b"a", PublishOptions::persistent(5))
            .await
            .unwrap();

        let channel = broker.open_channel(1).await.unwrap();
        let mut stream = channel.consume("q", "test").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queue_depth("q").await.unwrap().message_count, 0);
        assert_eq!(broker.unacked_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_returns_unacked_messages() {
        let broker = InMemoryBroker::new();
        broker.declare_queue("q", options()).await.unwrap();
        broker
            .publish("q", b"a", PublishOptions::persistent(5))
            .await
            .unwrap();

        let channel = broker.open_channel(1).await.unwrap();
        let mut stream = channel.consume("q", "test").await.unwrap();
        let _ = stream.next().await.unwrap().unwrap();
        assert_eq!(broker.queue_depth("q").await.unwrap().consumer_count, 1);

        channel.close().await.unwrap();

        let depth = broker.queue_depth("q").await.unwrap();
        assert_eq!(depth.message_count, 1);
        assert_eq!(depth.consumer_count, 0);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_message_ttl_expires_entries() {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(
                "dlq",
                QueueOptions {
                    max_priority: 15,
                    message_ttl: Some(Duration::from_millis(10)),
                },
            )
            .await
            .unwrap();
        broker
            .publish("dlq", b"a", PublishOptions::persistent(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(broker.queue_depth("dlq").await.unwrap().message_count, 0);
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        let result = broker
            .publish("missing", b"a", PublishOptions::persistent(5))
            .await;
        assert!(matches!(result, Err(DispatchError::Broker(_))));
    }

    #[tokio::test]
    async fn test_store_expiry() {
        let store = InMemoryStore::new();
        store.set_with_duration("k", "v", Duration::from_millis(10));
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[test]
    fn test_store_cleanup() {
        let store = InMemoryStore::new();
        store.set_with_duration("short", "v", Duration::from_millis(0));
        store.set_with_duration("long", "v", Duration::from_secs(60));

        store.cleanup();
        assert_eq!(store.len(), 1);
        assert_eq!(store.lookup("long"), Some("v".to_string()));
    }

    #[test]
    fn test_expired_lookup_keeps_concurrent_write() {
        let store = Arc::new(InMemoryStore::new());

        for round in 0..200 {
            let value = format!("fresh-{}", round);
            store.set_with_duration("k", "stale", Duration::ZERO);

            let readers: Vec<_> = (0..4)
                .map(|_| {
                    let store = Arc::clone(&store);
                    std::thread::spawn(move || {
                        for _ in 0..50 {
                            store.lookup("k");
                        }
                    })
                })
                .collect();
            store.set_with_duration("k", &value, Duration::from_secs(60));
            for reader in readers {
                reader.join().unwrap();
            }

            assert_eq!(store.lookup("k"), Some(value));
        }
    }
}
