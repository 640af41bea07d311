// Error types shared across the pipeline

use thiserror::Error;
use uuid::Uuid;

use crate::occurrence::OccurrenceStatus;

/// Errors from store implementations (occurrences, rules, notification queue)
#[derive(Debug, Error)]
pub enum StoreError {
    /// Record not found
    #[error("not found: {0}")]
    NotFound(Uuid),

    /// Rejected occurrence status transition
    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: OccurrenceStatus,
        to: OccurrenceStatus,
    },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn database(msg: impl Into<String>) -> Self {
        StoreError::Database(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        StoreError::Serialization(msg.into())
    }
}

/// Errors from the event bus
#[derive(Debug, Error)]
pub enum BusError {
    /// Bus backend unavailable (transient, retried by callers)
    #[error("bus unavailable: {0}")]
    Unavailable(String),

    /// Unknown consumer group
    #[error("unknown consumer group: {0}")]
    UnknownGroup(String),

    /// Malformed record on the stream
    #[error("malformed record at offset {offset}: {reason}")]
    Malformed { offset: u64, reason: String },
}

/// Errors from an event sink (bus publish or remote HTTP push)
#[derive(Debug, Error)]
pub enum SinkError {
    /// Transient failure, the record may be retried
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    /// The sink rejected the event; retrying the same payload will not help
    #[error("event rejected: {0}")]
    Rejected(String),
}

impl SinkError {
    /// Whether the poller should retry this record on the next cycle
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }
}

/// A record that cannot be turned into a canonical event
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}
