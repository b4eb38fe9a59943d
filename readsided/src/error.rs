//! Daemon error types.

use readside_domain::{DomainError, Tag};
use readside_eventlog::EventLogError;
use readside_projector::ProjectionError;
use readside_store::StoreError;
use thiserror::Error;

/// Daemon-level errors.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Domain error
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Event log error
    #[error("Event log error: {0}")]
    Log(#[from] EventLogError),

    /// Projection error
    #[error("Projection error: {0}")]
    Projection(#[from] ProjectionError),

    /// Tag not owned by any partition of this worker
    #[error("Partition not found: {0}")]
    PartitionNotFound(Tag),

    /// Restart requested for a partition that is not faulted
    #[error("Partition {tag} is not faulted (state: {state})")]
    PartitionNotFaulted { tag: Tag, state: String },

    /// Database connection error
    #[error("Database error: {0}")]
    Database(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Shutdown requested
    #[error("Shutdown requested")]
    Shutdown,
}

impl From<prometheus::Error> for DaemonError {
    fn from(e: prometheus::Error) -> Self {
        DaemonError::Metrics(e.to_string())
    }
}

/// Result type for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
