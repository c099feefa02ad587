use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
};
use tracing::{debug, info};

use crate::{
    clients::broker::{
        Broker, BrokerChannel, Delivery, DeliveryStream, PublishOptions, QueueOptions,
    },
    error::{DispatchError, Result},
    models::{retry::RetryConfig, status::QueueDepth},
    utils::retry_with_backoff,
};

const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct RabbitMqBroker {
    connection: Connection,
    channel: Channel,
}

impl RabbitMqBroker {
    pub async fn connect(url: &str, retry_config: &RetryConfig) -> Result<Self> {
        info!("Connecting to RabbitMQ");

        let connection = retry_with_backoff("rabbitmq_connect", retry_config, || {
            Connection::connect(url, ConnectionProperties::default())
        })
        .await?;

        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        info!("RabbitMQ connection established");

        Ok(Self {
            connection,
            channel,
        })
    }
}

fn queue_arguments(options: QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-max-priority".into(),
        AMQPValue::ShortShortUInt(options.max_priority),
    );
    if let Some(ttl) = options.message_ttl {
        arguments.insert(
            "x-message-ttl".into(),
            AMQPValue::LongUInt(ttl.as_millis().min(u32::MAX as u128) as u32),
        );
    }
    arguments
}

fn properties(options: PublishOptions) -> BasicProperties {
    let properties = BasicProperties::default()
        .with_content_type("application/json".into())
        .with_priority(options.priority);

    if options.persistent {
        properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE)
    } else {
        properties
    }
}

async fn publish_confirmed(
    channel: &Channel,
    queue: &str,
    payload: &[u8],
    options: PublishOptions,
) -> Result<()> {
    let confirmation = channel
        .basic_publish(
            "",
            queue,
            BasicPublishOptions::default(),
            payload,
            properties(options),
        )
        .await?
        .await?;

    if let Confirmation::Nack(_) = confirmation {
        return Err(DispatchError::Broker(format!(
            "Publish to {} was not confirmed",
            queue
        )));
    }

    Ok(())
}

#[async_trait]
impl Broker for RabbitMqBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<()> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                queue_arguments(options),
            )
            .await?;

        debug!(queue = name, max_priority = options.max_priority, "Queue declared");

        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        publish_confirmed(&self.channel, queue, payload, options).await
    }

    async fn queue_depth(&self, name: &str) -> Result<QueueDepth> {
        // A passive declare on a missing queue closes its channel, so probe on
        // a throwaway one.
        let channel = self.connection.create_channel().await?;
        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        let depth = QueueDepth {
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        };

        channel.close(200, "Depth probe complete").await?;

        Ok(depth)
    }

    async fn open_channel(&self, prefetch: u16) -> Result<Box<dyn BrokerChannel>> {
        let channel = self.connection.create_channel().await?;

        // Global QoS caps the whole channel rather than each consumer, so the
        // main and retry subscriptions share one in-flight slot.
        channel
            .basic_qos(prefetch, BasicQosOptions { global: true })
            .await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Ok(Box::new(RabbitMqChannel { channel }))
    }
}

pub struct RabbitMqChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let queue = queue.to_string();
        let stream = consumer.map(move |item| {
            item.map(|delivery| Delivery {
                delivery_tag: delivery.delivery_tag,
                queue: queue.clone(),
                data: delivery.data,
            })
            .map_err(DispatchError::from)
        });

        Ok(stream.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: &[u8], options: PublishOptions) -> Result<()> {
        publish_confirmed(&self.channel, queue, payload, options).await
    }

    async fn close(&self) -> Result<()> {
        self.channel.close(200, "Worker shutting down").await?;
        Ok(())
    }
}
