//! PostgreSQL event log adapter.
//!
//! Uses dynamic queries (sqlx::query) instead of compile-time checked macros
//! so the crate builds without DATABASE_URL. Tables are created by
//! `readside-db`.

use async_trait::async_trait;
use readside_domain::{AggregateEventTag, HelloEvent, Offset, Tag};
use sqlx::PgPool;

use crate::append::append_event;
use crate::query::{query_tag_events, query_tag_head};
use crate::reader::{EventLog, EventWriter};
use crate::types::{EventEnvelope, Result};

/// Event log backed by the `event_log` and `tag_state` tables.
///
/// Readers poll: `wait_for_append` uses the default sleep.
#[derive(Clone)]
pub struct PgEventLog {
    pool: PgPool,
    tags: AggregateEventTag,
}

impl PgEventLog {
    /// Create a new PostgreSQL event log.
    pub fn new(pool: PgPool, tags: AggregateEventTag) -> Self {
        Self { pool, tags }
    }

    /// Get a reference to the underlying pool (for testing).
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventWriter for PgEventLog {
    async fn append(&self, event: HelloEvent) -> Result<EventEnvelope> {
        append_event(&self.pool, &self.tags, event).await
    }
}

#[async_trait]
impl EventLog for PgEventLog {
    async fn read_batch(
        &self,
        tag: &Tag,
        after: Offset,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>> {
        query_tag_events(&self.pool, tag, after, limit).await
    }

    async fn head(&self, tag: &Tag) -> Result<Offset> {
        query_tag_head(&self.pool, tag).await
    }
}
