use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result};
use dispatch_service::{
    clients::{
        delivery::{Deliverer, LoggingDeliverer, WebhookDeliverer},
        health::QueueHealthMonitor,
        metrics::TracingMetrics,
        rbmq::RabbitMqBroker,
        redis::RedisStore,
    },
    config::Config,
    dispatcher::PriorityDispatcher,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let config = Config::load()?;
    init_tracing(config.log_json);

    let retry_config = config.retry_config();
    let broker = Arc::new(RabbitMqBroker::connect(&config.rabbitmq_url, &retry_config).await?);
    let store = Arc::new(RedisStore::connect(&config.redis_url, &retry_config).await?);

    let deliverer: Arc<dyn Deliverer> = match &config.delivery_webhook_url {
        Some(url) => {
            let timeout = config
                .delivery_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_WEBHOOK_TIMEOUT);
            Arc::new(WebhookDeliverer::new(url.clone(), timeout)?)
        }
        None => Arc::new(LoggingDeliverer),
    };

    let topology = config.topology();
    let monitor = Arc::new(QueueHealthMonitor::new(
        topology.all(),
        config.monitor_config(),
        Arc::new(TracingMetrics),
    ));

    let dispatcher = PriorityDispatcher::new(
        broker,
        deliverer,
        store,
        monitor,
        config.dispatcher_config(),
    );

    dispatcher.initialize().await?;
    dispatcher.start().await?;

    info!(workers = config.worker_count, "Dispatch service running");

    tokio::signal::ctrl_c().await?;

    dispatcher.shutdown().await;

    Ok(())
}
