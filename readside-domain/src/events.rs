//! Domain events of the hello aggregate
//!
//! Events are immutable records of state changes, produced by the write side
//! and read-only to the projector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Events emitted by the hello aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HelloEvent {
    /// A user set a new greeting message
    GreetingMessageChanged {
        /// User (entity) identifier
        name: String,
        /// New greeting
        message: String,
        /// When the change happened
        timestamp: DateTime<Utc>,
    },

    /// A user removed their greeting message
    GreetingCleared {
        /// User (entity) identifier
        name: String,
        /// When the greeting was removed
        timestamp: DateTime<Utc>,
    },

    /// Someone was greeted; audit only, no read-model effect
    HelloSaid {
        /// User (entity) identifier
        name: String,
        /// When the greeting was said
        timestamp: DateTime<Utc>,
    },
}

/// Discriminant of [`HelloEvent`], used as a handler key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// [`HelloEvent::GreetingMessageChanged`]
    GreetingMessageChanged,
    /// [`HelloEvent::GreetingCleared`]
    GreetingCleared,
    /// [`HelloEvent::HelloSaid`]
    HelloSaid,
}

impl HelloEvent {
    /// Kind of this event
    pub fn kind(&self) -> EventKind {
        match self {
            HelloEvent::GreetingMessageChanged { .. } => EventKind::GreetingMessageChanged,
            HelloEvent::GreetingCleared { .. } => EventKind::GreetingCleared,
            HelloEvent::HelloSaid { .. } => EventKind::HelloSaid,
        }
    }

    /// Entity id this event belongs to
    pub fn entity_id(&self) -> &str {
        match self {
            HelloEvent::GreetingMessageChanged { name, .. }
            | HelloEvent::GreetingCleared { name, .. }
            | HelloEvent::HelloSaid { name, .. } => name,
        }
    }

    /// When the event happened
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            HelloEvent::GreetingMessageChanged { timestamp, .. }
            | HelloEvent::GreetingCleared { timestamp, .. }
            | HelloEvent::HelloSaid { timestamp, .. } => *timestamp,
        }
    }

    /// Convenience constructor for a greeting change stamped now
    pub fn greeting_changed(name: impl Into<String>, message: impl Into<String>) -> Self {
        HelloEvent::GreetingMessageChanged {
            name: name.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    /// Convenience constructor for a greeting removal stamped now
    pub fn greeting_cleared(name: impl Into<String>) -> Self {
        HelloEvent::GreetingCleared { name: name.into(), timestamp: Utc::now() }
    }

    /// Convenience constructor for an audit greeting stamped now
    pub fn hello_said(name: impl Into<String>) -> Self {
        HelloEvent::HelloSaid { name: name.into(), timestamp: Utc::now() }
    }
}

impl EventKind {
    /// Every kind, in declaration order
    pub const ALL: [EventKind; 3] =
        [EventKind::GreetingMessageChanged, EventKind::GreetingCleared, EventKind::HelloSaid];

    /// Stable name, also used as the `event_type` column
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::GreetingMessageChanged => "greeting_message_changed",
            EventKind::GreetingCleared => "greeting_cleared",
            EventKind::HelloSaid => "hello_said",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
