use thiserror::Error;

/// Coarse classification used to decide how a failure propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before enqueue, never retried.
    Admission,
    /// Delivery failed but the message has attempts left.
    TransientDelivery,
    /// Retry budget spent; the message is dead-lettered.
    TerminalDelivery,
    /// Broker or key-value store unreachable or misbehaving.
    Infrastructure,
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Batch is empty")]
    EmptyBatch,

    #[error("Batch of {size} messages exceeds the maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Delivery failed: {0}")]
    TransientDelivery(String),

    #[error("Delivery failed after {attempts} attempts: {reason}")]
    TerminalDelivery { attempts: u32, reason: String },

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::EmptyBatch
            | DispatchError::BatchTooLarge { .. }
            | DispatchError::MalformedMessage(_)
            | DispatchError::UnknownQueue(_) => ErrorKind::Admission,
            DispatchError::TransientDelivery(_) => ErrorKind::TransientDelivery,
            DispatchError::TerminalDelivery { .. } => ErrorKind::TerminalDelivery,
            DispatchError::Broker(_)
            | DispatchError::Store(_)
            | DispatchError::Serialization(_) => ErrorKind::Infrastructure,
        }
    }

    pub fn is_admission(&self) -> bool {
        self.kind() == ErrorKind::Admission
    }
}

impl From<lapin::Error> for DispatchError {
    fn from(err: lapin::Error) -> Self {
        DispatchError::Broker(err.to_string())
    }
}

impl From<redis::RedisError> for DispatchError {
    fn from(err: redis::RedisError) -> Self {
        DispatchError::Store(err.to_string())
    }
}

pub type Result<T, E = DispatchError> = std::result::Result<T, E>;
