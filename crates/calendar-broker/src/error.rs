//! Broker and handler error types

/// Errors returned by the broker client and log backends
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Publish attempted before a connection was established
    #[error("publisher is not ready")]
    PublisherNotReady,

    /// The log cannot be reached
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Connecting was abandoned because the caller cancelled
    #[error("connect cancelled")]
    Cancelled,

    /// A handler is already registered for this topic and group
    #[error("group {group} already subscribed to topic {topic}")]
    DuplicateSubscription { topic: String, group: String },

    /// Partition outside the topic's partition range
    #[error("partition {partition} out of range for topic {topic}")]
    InvalidPartition { topic: String, partition: i32 },

    /// Database error in a database-backed log
    #[error("database error: {0}")]
    Database(String),

    /// Payload could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BrokerError {
    /// Whether retrying the same call later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Database(_))
    }
}

/// Outcome a handler reports for a message it could not process
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Leave the message uncommitted so it is delivered again
    #[error("retry: {0}")]
    Retry(String),

    /// Commit past a message that can never be processed
    #[error("discard: {0}")]
    Discard(String),
}

impl HandlerError {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::Retry(reason.into())
    }

    pub fn discard(reason: impl Into<String>) -> Self {
        Self::Discard(reason.into())
    }
}
