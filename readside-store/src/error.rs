//! Storage layer errors

use readside_domain::{Offset, Tag};
use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Debug, Error)]
pub enum StoreError {
    /// Stored offset differs from the one the committer expected.
    ///
    /// Another worker committed for this tag; the caller no longer owns it.
    #[error("Stale offset for {tag}: expected {expected:?}, found {actual:?}")]
    StaleOffset {
        /// Tag being committed
        tag: Tag,
        /// Offset the committer last saw
        expected: Option<Offset>,
        /// Offset actually stored
        actual: Option<Offset>,
    },

    /// New offset does not move past the expected one
    #[error("Non-monotonic offset for {tag}: {new} does not follow {expected:?}")]
    NonMonotonicOffset {
        /// Tag being committed
        tag: Tag,
        /// Offset the committer last saw
        expected: Option<Offset>,
        /// Offset that was to be stored
        new: Offset,
    },

    /// Storage temporarily unreachable
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Schema could not be created
    #[error("Schema initialization failed: {0}")]
    SchemaInit(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// Domain error passthrough
    #[error("Domain error: {0}")]
    Domain(#[from] readside_domain::DomainError),
}

impl StoreError {
    /// True if the commit lost a race with another worker
    pub fn is_stale(&self) -> bool {
        matches!(self, StoreError::StaleOffset { .. })
    }

    /// True when the store could not be reached; the same write may succeed later
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreError::Unavailable(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Serialization(err.to_string())
            },
            _ => StoreError::Database(err.to_string()),
        }
    }
}
