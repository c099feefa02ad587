use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use dispatch_service::{
    clients::{
        broker::{Broker, BrokerChannel, PublishOptions, QueueOptions, TtlStore},
        delivery::Deliverer,
        health::{MonitorConfig, QueueHealthMonitor},
        memory::{InMemoryBroker, InMemoryStore},
        metrics::NoopMetrics,
    },
    dispatcher::{DispatcherConfig, PriorityDispatcher},
    error::{DispatchError, Result},
    ingestion::{BatchIngestor, IngestionConfig},
    models::{message::NotificationMessage, status::QueueDepth},
};

/// Wraps [`InMemoryBroker`] and refuses publishes whose payload contains
/// `poison`.
pub struct FlakyBroker {
    pub inner: InMemoryBroker,
    poison: Vec<u8>,
}

impl FlakyBroker {
    pub fn new(inner: InMemoryBroker, poison: &str) -> Self {
        Self {
            inner,
            poison: poison.as_bytes().to_vec(),
        }
    }
}

#[async_trait]
impl Broker for FlakyBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.inner.declare_queue(name, options).await
    }

    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        if payload
            .windows(self.poison.len())
            .any(|window| window == self.poison.as_slice())
        {
            return Err(DispatchError::Broker("publish refused".to_string()));
        }
        self.inner.publish(queue, payload, options).await
    }

    async fn queue_depth(&self, name: &str) -> Result<QueueDepth> {
        self.inner.queue_depth(name).await
    }

    async fn open_channel(&self, prefetch: u16) -> Result<Box<dyn BrokerChannel>> {
        self.inner.open_channel(prefetch).await
    }
}

/// Store whose every call fails.
pub struct FailingStore;

#[async_trait]
impl TtlStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>> {
        Err(DispatchError::Store("connection refused".to_string()))
    }

    async fn set_with_ttl(&self, _key: &str, _value: &str, _ttl_seconds: u64) -> Result<()> {
        Err(DispatchError::Store("connection refused".to_string()))
    }
}

/// [`InMemoryStore`] that counts how often it is touched.
#[derive(Default)]
pub struct CountingStore {
    pub inner: InMemoryStore,
    calls: AtomicUsize,
}

impl CountingStore {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TtlStore for CountingStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.set_with_ttl(key, value, ttl_seconds).await
    }
}

/// Records every delivered message id; fails when `failing` is set.
#[derive(Default)]
pub struct RecordingDeliverer {
    pub failing: bool,
    attempts: AtomicUsize,
    delivered: Mutex<Vec<String>>,
}

impl RecordingDeliverer {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Deliverer for RecordingDeliverer {
    async fn deliver(&self, message: &NotificationMessage) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(anyhow!("provider rejected {}", message.id));
        }
        self.delivered.lock().unwrap().push(message.id.clone());
        Ok(())
    }
}

pub struct Harness {
    pub broker: InMemoryBroker,
    pub store: Arc<InMemoryStore>,
    pub deliverer: Arc<RecordingDeliverer>,
    pub dispatcher: Arc<PriorityDispatcher>,
}

impl Harness {
    pub async fn new(deliverer: RecordingDeliverer, worker_count: usize) -> Self {
        let broker = InMemoryBroker::new();
        Self::with_broker(broker.clone(), Arc::new(broker), deliverer, worker_count).await
    }

    pub async fn with_broker(
        broker: InMemoryBroker,
        publish_broker: Arc<dyn Broker>,
        deliverer: RecordingDeliverer,
        worker_count: usize,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let deliverer = Arc::new(deliverer);
        let config = DispatcherConfig {
            worker_count,
            snapshot_interval: Duration::from_secs(3600),
            ..DispatcherConfig::default()
        };

        let monitor = Arc::new(QueueHealthMonitor::new(
            config.topology.all(),
            MonitorConfig::default(),
            Arc::new(NoopMetrics),
        ));

        let dispatcher = Arc::new(PriorityDispatcher::new(
            publish_broker,
            deliverer.clone(),
            store.clone(),
            monitor,
            config,
        ));
        dispatcher.initialize().await.unwrap();

        Self {
            broker,
            store,
            deliverer,
            dispatcher,
        }
    }

    pub fn ingestor(&self, dedup_store: Arc<dyn TtlStore>) -> BatchIngestor {
        BatchIngestor::new(
            Arc::clone(&self.dispatcher),
            dedup_store,
            IngestionConfig::default(),
        )
    }

    pub async fn queued_messages(&self, queue: &str) -> Vec<NotificationMessage> {
        self.broker
            .queued_payloads(queue)
            .await
            .iter()
            .map(|payload| serde_json::from_slice(payload).unwrap())
            .collect()
    }
}

pub fn notification(user: &str, title: &str) -> NotificationMessage {
    NotificationMessage::new(user, "account", title, format!("{} body", title))
}

/// Polls `condition` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
