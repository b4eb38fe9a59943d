//! Projection errors

use readside_domain::EventKind;
use readside_eventlog::EventLogError;
use readside_store::StoreError;
use thiserror::Error;

/// Failure of a single handler on a single event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    #[error("Handler for {expected} received {actual}")]
    UnexpectedEvent { expected: EventKind, actual: EventKind },

    #[error("Invalid greeting id {id:?}: {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Greeting message for {id} is {len} characters, at most {max} allowed")]
    MessageTooLong { id: String, len: usize, max: usize },

    #[error("Handler failed: {0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("Handler already registered for {0}")]
    DuplicateHandler(EventKind),

    #[error("Schema initialization failed: {0}")]
    SchemaInit(#[source] StoreError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event log error: {0}")]
    Log(#[from] EventLogError),
}

pub type Result<T> = std::result::Result<T, ProjectionError>;
