//! Read-side entities
//!
//! - `UserGreeting`: one materialized read-model row
//! - `Lease`: time-bounded ownership of a tag partition

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::value_objects::{Tag, WorkerId};

/// Maximum length of a greeting id (column width)
pub const MAX_GREETING_ID_LEN: usize = 64;

/// Maximum length of a greeting message (column width)
pub const MAX_GREETING_MESSAGE_LEN: usize = 256;

// =============================================================================
// UserGreeting
// =============================================================================

/// Materialized greeting of one user, keyed by user id.
///
/// Rows are plain values: handlers describe an upsert of the whole row,
/// last write wins per id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserGreeting {
    /// User id (business key)
    pub id: String,
    /// Current greeting message
    pub message: String,
}

impl UserGreeting {
    /// Create a row
    pub fn new(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self { id: id.into(), message: message.into() }
    }
}

// =============================================================================
// Lease
// =============================================================================

/// Exclusive, time-bounded ownership of one tag by one worker.
///
/// The `token` identifies a single grant. Renewing or releasing with a token
/// that no longer matches the stored lease has no effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Owned partition
    pub tag: Tag,
    /// Owner
    pub worker_id: WorkerId,
    /// Grant identifier
    pub token: Uuid,
    /// Time to live from the last acquire/renew
    #[serde(with = "duration_millis")]
    pub ttl: Duration,
    /// When this grant was first acquired
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    /// Create a fresh grant
    pub fn grant(tag: Tag, worker_id: WorkerId, ttl: Duration) -> Self {
        Self { tag, worker_id, token: Uuid::now_v7(), ttl, acquired_at: Utc::now() }
    }

    /// True if `worker_id` holds this lease
    pub fn is_held_by(&self, worker_id: &WorkerId) -> bool {
        &self.worker_id == worker_id
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
