use std::fmt::{Display, Formatter, Result as FmtResult};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::utils::derive_deduplication_key;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Priority tier of a notification.
///
/// The numeric value handed to the broker is a scheduling hint in the range
/// 0-15, not a strict ordering guarantee.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Every tier, most urgent first.
    pub const ALL: [Priority; 4] = [
        Priority::Urgent,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub const fn broker_priority(self) -> u8 {
        match self {
            Priority::Urgent => 15,
            Priority::High => 10,
            Priority::Normal => 5,
            Priority::Low => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Display for Priority {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// The unit of work carried through the queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    pub title: String,
    pub body: String,

    #[serde(default)]
    pub data: JsonValue,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl NotificationMessage {
    pub fn new(
        user_id: impl Into<String>,
        notification_type: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            notification_type: notification_type.into(),
            title: title.into(),
            body: body.into(),
            data: JsonValue::Null,
            priority: Priority::Normal,
            scheduled_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            deduplication_key: None,
            batch_id: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_data(mut self, data: JsonValue) -> Self {
        self.data = data;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_deduplication_key(mut self, key: impl Into<String>) -> Self {
        self.deduplication_key = Some(key.into());
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(scheduled_at);
        self
    }

    /// The explicit deduplication key when one was supplied, otherwise a key
    /// derived from user, type, title and body.
    pub fn effective_deduplication_key(&self) -> String {
        match &self.deduplication_key {
            Some(key) => key.clone(),
            None => derive_deduplication_key(
                &self.user_id,
                &self.notification_type,
                &self.title,
                &self.body,
            ),
        }
    }

    /// True when the retry budget is spent, so the next failed attempt must
    /// go to the dead-letter queue instead of the retry queue.
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Counts one failed attempt. Returns whether the message is now bound
    /// for the dead-letter queue.
    pub fn record_failed_attempt(&mut self) -> bool {
        let exhausted = self.retries_exhausted();
        self.retry_count = self.retry_count.saturating_add(1);
        exhausted
    }
}

/// Envelope published to the dead-letter queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqMessage {
    #[serde(flatten)]
    pub message: NotificationMessage,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

impl DlqMessage {
    pub fn new(message: NotificationMessage, error: String) -> Self {
        Self {
            message,
            error,
            failed_at: Utc::now(),
        }
    }
}
