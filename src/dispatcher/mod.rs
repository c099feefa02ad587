//! Priority dispatcher: queue topology, worker pool and the periodic state
//! snapshot.

mod worker;

use std::{
    collections::HashMap,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use futures_util::{StreamExt, stream};
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    clients::{
        broker::{Broker, PublishOptions, QueueOptions, TtlStore},
        delivery::Deliverer,
        health::QueueHealthMonitor,
    },
    error::Result,
    models::{
        message::NotificationMessage,
        snapshot::DispatcherSnapshot,
        status::{WorkerPoolStatus, WorkerStatus},
    },
};

pub use worker::ProcessingOutcome;
use worker::Worker;

/// Each worker holds at most one unacknowledged message. This is the only
/// backpressure between the broker and the delivery collaborator.
pub const WORKER_PREFETCH: u16 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    pub main: String,
    pub retry: String,
    pub dead_letter: String,
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self {
            main: "notifications.main".to_string(),
            retry: "notifications.retry".to_string(),
            dead_letter: "notifications.dead_letter".to_string(),
        }
    }
}

impl QueueTopology {
    pub fn all(&self) -> [&str; 3] {
        [&self.main, &self.retry, &self.dead_letter]
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub topology: QueueTopology,
    pub max_priority: u8,
    pub dead_letter_ttl: Duration,
    pub worker_count: usize,
    /// Upper bound on a single delivery call. `None` waits indefinitely.
    pub delivery_timeout: Option<Duration>,
    pub snapshot_interval: Duration,
    pub snapshot_ttl_seconds: u64,
    pub snapshot_key: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            topology: QueueTopology::default(),
            max_priority: 15,
            dead_letter_ttl: Duration::from_secs(24 * 60 * 60),
            worker_count: 5,
            delivery_timeout: None,
            snapshot_interval: Duration::from_secs(30),
            snapshot_ttl_seconds: 24 * 60 * 60,
            snapshot_key: "dispatcher:state".to_string(),
        }
    }
}

struct WorkerHandle {
    id: usize,
    busy: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    fn status(&self) -> WorkerStatus {
        if self.busy.load(Ordering::Acquire) {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        }
    }
}

#[derive(Clone)]
struct SnapshotWriter {
    broker: Arc<dyn Broker>,
    store: Arc<dyn TtlStore>,
    monitor: Arc<QueueHealthMonitor>,
    queues: Vec<String>,
    key: String,
    ttl_seconds: u64,
}

impl SnapshotWriter {
    async fn capture(&self) -> DispatcherSnapshot {
        let mut queues = HashMap::new();

        for queue in &self.queues {
            match self.broker.queue_depth(queue).await {
                Ok(depth) => {
                    self.monitor
                        .record_queue_length(queue, u64::from(depth.message_count));
                    queues.insert(queue.clone(), depth);
                }
                Err(e) => {
                    warn!(queue = %queue, error = %e, "Failed to read queue depth");
                }
            }
        }

        DispatcherSnapshot {
            timestamp: Utc::now(),
            queues,
        }
    }

    async fn write(&self) -> Result<DispatcherSnapshot> {
        let snapshot = self.capture().await;
        let json = serde_json::to_string(&snapshot)?;

        self.store
            .set_with_ttl(&self.key, &json, self.ttl_seconds)
            .await?;

        debug!(key = %self.key, queues = snapshot.queues.len(), "Dispatcher snapshot written");

        Ok(snapshot)
    }

    async fn run(self, every: Duration, shutdown: CancellationToken) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.write().await {
                        warn!(error = %e, "Failed to write dispatcher snapshot");
                    }
                }
            }
        }
    }
}

/// Owns the queues and the worker pool.
///
/// Workers consume `main` and `retry`; failed deliveries move to `retry`
/// until the message's retry budget is spent, then to `dead_letter`.
pub struct PriorityDispatcher {
    broker: Arc<dyn Broker>,
    deliverer: Arc<dyn Deliverer>,
    monitor: Arc<QueueHealthMonitor>,
    snapshots: SnapshotWriter,
    config: DispatcherConfig,
    workers: Mutex<Vec<WorkerHandle>>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    started_at: OnceLock<Instant>,
}

impl PriorityDispatcher {
    pub fn new(
        broker: Arc<dyn Broker>,
        deliverer: Arc<dyn Deliverer>,
        snapshot_store: Arc<dyn TtlStore>,
        monitor: Arc<QueueHealthMonitor>,
        config: DispatcherConfig,
    ) -> Self {
        for queue in config.topology.all() {
            monitor.register_queue(queue);
        }

        let snapshots = SnapshotWriter {
            broker: Arc::clone(&broker),
            store: snapshot_store,
            monitor: Arc::clone(&monitor),
            queues: config.topology.all().map(String::from).to_vec(),
            key: config.snapshot_key.clone(),
            ttl_seconds: config.snapshot_ttl_seconds,
        };

        Self {
            broker,
            deliverer,
            monitor,
            snapshots,
            config,
            workers: Mutex::new(Vec::new()),
            snapshot_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
            started_at: OnceLock::new(),
        }
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.config.topology
    }

    pub fn monitor(&self) -> &Arc<QueueHealthMonitor> {
        &self.monitor
    }

    /// Declares the main, retry and dead-letter queues.
    pub async fn initialize(&self) -> Result<()> {
        let topology = &self.config.topology;
        let options = QueueOptions {
            max_priority: self.config.max_priority,
            message_ttl: None,
        };

        self.broker.declare_queue(&topology.main, options).await?;
        self.broker.declare_queue(&topology.retry, options).await?;
        self.broker
            .declare_queue(
                &topology.dead_letter,
                QueueOptions {
                    message_ttl: Some(self.config.dead_letter_ttl),
                    ..options
                },
            )
            .await?;

        info!(
            main = %topology.main,
            retry = %topology.retry,
            dead_letter = %topology.dead_letter,
            "Dispatcher queues declared"
        );

        match self.last_snapshot().await {
            Ok(Some(snapshot)) => info!(
                taken_at = %snapshot.timestamp,
                queues = ?snapshot.queues,
                "Found previous dispatcher snapshot"
            ),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Could not read previous dispatcher snapshot"),
        }

        Ok(())
    }

    /// Spawns the worker pool and the snapshot task. Calling it again on a
    /// running dispatcher is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return Ok(());
        }

        let topology = &self.config.topology;

        for id in 0..self.config.worker_count {
            let channel = self.broker.open_channel(WORKER_PREFETCH).await?;
            let main = channel
                .consume(&topology.main, &format!("worker-{}-main", id))
                .await?;
            let retry = channel
                .consume(&topology.retry, &format!("worker-{}-retry", id))
                .await?;

            let busy = Arc::new(AtomicBool::new(false));
            let worker = Worker {
                id,
                channel,
                deliverer: Arc::clone(&self.deliverer),
                monitor: Arc::clone(&self.monitor),
                topology: topology.clone(),
                delivery_timeout: self.config.delivery_timeout,
                busy: Arc::clone(&busy),
            };

            let deliveries = stream::select(main, retry).boxed();
            let task = tokio::spawn(worker.run(deliveries, self.shutdown.child_token()));

            workers.push(WorkerHandle { id, busy, task });
        }

        let writer = self.snapshots.clone();
        let task = tokio::spawn(
            writer.run(self.config.snapshot_interval, self.shutdown.child_token()),
        );
        *self.snapshot_task.lock().await = Some(task);

        let _ = self.started_at.set(Instant::now());

        info!(workers = workers.len(), prefetch = WORKER_PREFETCH, "Worker pool started");

        Ok(())
    }

    /// Publishes a message to the main queue. Failures propagate: the message
    /// was not admitted.
    pub async fn enqueue_notification(&self, message: &NotificationMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let priority = message.priority.broker_priority();

        self.broker
            .publish(
                &self.config.topology.main,
                &payload,
                PublishOptions::persistent(priority),
            )
            .await?;

        debug!(
            message_id = %message.id,
            priority = %message.priority,
            broker_priority = priority,
            "Notification enqueued"
        );

        Ok(())
    }

    pub async fn get_worker_pool_status(&self) -> Result<WorkerPoolStatus> {
        let (total_workers, active_workers) = {
            let workers = self.workers.lock().await;
            let active = workers
                .iter()
                .filter(|w| w.status() == WorkerStatus::Busy)
                .count();
            (workers.len(), active)
        };

        let uptime = self
            .started_at
            .get()
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let mut queue_lengths = HashMap::new();
        let mut processing_rates = HashMap::new();

        for queue in self.config.topology.all() {
            let depth = self.broker.queue_depth(queue).await?;
            queue_lengths.insert(queue.to_string(), depth.message_count);

            let processed = self
                .monitor
                .get_queue_metrics(queue)
                .map(|m| m.total_processed)
                .unwrap_or(0);
            let rate = if uptime > 0.0 {
                processed as f64 / uptime
            } else {
                0.0
            };
            processing_rates.insert(queue.to_string(), rate);
        }

        Ok(WorkerPoolStatus {
            total_workers,
            active_workers,
            idle_workers: total_workers - active_workers,
            queue_lengths,
            processing_rates,
        })
    }

    /// Writes a snapshot immediately, outside the periodic schedule.
    pub async fn write_snapshot(&self) -> Result<DispatcherSnapshot> {
        self.snapshots.write().await
    }

    pub async fn last_snapshot(&self) -> Result<Option<DispatcherSnapshot>> {
        let raw = self.snapshots.store.get(&self.snapshots.key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Stops consuming, lets in-flight messages finish, writes a final
    /// snapshot and closes every worker channel.
    pub async fn shutdown(&self) {
        info!("Dispatcher shutting down");
        self.shutdown.cancel();

        if let Some(task) = self.snapshot_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Snapshot task ended abnormally");
            }
        }

        if let Err(e) = self.snapshots.write().await {
            warn!(error = %e, "Failed to write final dispatcher snapshot");
        }

        let workers: Vec<WorkerHandle> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.task.await {
                error!(worker_id = handle.id, error = %e, "Worker task ended abnormally");
            }
        }

        info!("Dispatcher stopped");
    }
}
