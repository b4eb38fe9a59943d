//! Event Log Types

use chrono::{DateTime, Utc};
use readside_domain::{EventKind, HelloEvent, Offset, Tag};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Persisted event with its log position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    // Identity
    pub event_id: Uuid,
    pub entity_id: String,

    // Partitioning
    pub tag: Tag,
    pub offset: Offset,

    // Event data
    pub event: HelloEvent,

    // Temporal
    pub occurred_at: DateTime<Utc>,
    pub persisted_at: DateTime<Utc>,
}

impl EventEnvelope {
    /// Kind of the wrapped event
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

/// Item produced by a tag subscription
#[derive(Debug, Clone, PartialEq)]
pub enum LogItem {
    /// Next event of the tag, in offset order
    Event(EventEnvelope),
    /// The reader reached the log head and is about to wait for new events
    CaughtUp { head: Offset },
}

/// Event log errors
#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    /// Storage could not be read or written; transient, retry with backoff
    #[error("Event log unavailable: {0}")]
    LogUnavailable(String),

    /// Requested start offset lies beyond the log head
    #[error("Invalid offset {offset} for tag {tag}: log head is {head}")]
    InvalidOffset { tag: Tag, offset: Offset, head: Offset },

    /// Stored event cannot be decoded
    #[error("Corrupt event at {tag}@{offset}: {reason}")]
    Corrupt { tag: Tag, offset: Offset, reason: String },

    /// Event cannot be encoded for storage
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EventLogError {
    /// True for errors a reader should retry (with backoff) rather than give up on
    pub fn is_transient(&self) -> bool {
        matches!(self, EventLogError::LogUnavailable(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for EventLogError {
    fn from(err: sqlx::Error) -> Self {
        EventLogError::LogUnavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EventLogError>;
