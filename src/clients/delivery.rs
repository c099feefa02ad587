use std::time::Duration;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

use crate::models::message::NotificationMessage;

/// Outbound transport for a single notification. Any `Err` is treated as a
/// delivery failure that may be retried.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, message: &NotificationMessage) -> Result<(), Error>;
}

/// Accepts every message and only logs it. Used when no gateway is
/// configured.
#[derive(Debug, Default, Clone)]
pub struct LoggingDeliverer;

#[async_trait]
impl Deliverer for LoggingDeliverer {
    async fn deliver(&self, message: &NotificationMessage) -> Result<(), Error> {
        info!(
            message_id = %message.id,
            user_id = %message.user_id,
            notification_type = %message.notification_type,
            priority = %message.priority,
            "Delivering notification (dry run)"
        );
        Ok(())
    }
}

/// POSTs the message JSON to a channel gateway. Non-2xx responses count as
/// failures.
pub struct WebhookDeliverer {
    http_client: Client,
    url: String,
}

impl WebhookDeliverer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        let url = url.into();
        info!(url = %url, "Webhook deliverer initialized");

        Ok(Self { http_client, url })
    }
}

#[async_trait]
impl Deliverer for WebhookDeliverer {
    async fn deliver(&self, message: &NotificationMessage) -> Result<(), Error> {
        debug!(message_id = %message.id, "Posting notification to gateway");

        let response = self
            .http_client
            .post(&self.url)
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let error_text = response.text().await.unwrap_or_default();
            Err(anyhow!("Gateway returned {}: {}", status, error_text))
        }
    }
}
