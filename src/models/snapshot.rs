use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::status::QueueDepth;

/// Advisory record of broker queue depths, written periodically for
/// operators and restart diagnostics. Durable message state stays in the
/// broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherSnapshot {
    pub timestamp: DateTime<Utc>,
    pub queues: HashMap<String, QueueDepth>,
}
