//! Event Querying

use chrono::{DateTime, Utc};
use readside_domain::{HelloEvent, Offset, Tag};
use sqlx::PgPool;
use uuid::Uuid;

use crate::append::offset_from_db;
use crate::types::{EventEnvelope, EventLogError, Result};

/// Read events of one tag after an exclusive offset, ascending
pub async fn query_tag_events(
    pool: &PgPool,
    tag: &Tag,
    after: Offset,
    limit: usize,
) -> Result<Vec<EventEnvelope>> {
    let rows = sqlx::query_as::<_, EventEnvelopeRow>(
        r#"
        SELECT event_id, seq, entity_id, payload, occurred_at, persisted_at
        FROM event_log
        WHERE tag = $1
          AND seq > $2
        ORDER BY seq ASC
        LIMIT $3
        "#,
    )
    .bind(tag.as_str())
    .bind(after.value())
    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
    .fetch_all(pool)
    .await?;

    rows.into_iter().map(|row| row.into_envelope(tag)).collect()
}

/// Highest committed offset of a tag
pub async fn query_tag_head(pool: &PgPool, tag: &Tag) -> Result<Offset> {
    let seq: Option<i64> = sqlx::query_scalar("SELECT last_seq FROM tag_state WHERE tag = $1")
        .bind(tag.as_str())
        .fetch_optional(pool)
        .await?;

    Ok(seq.map(offset_from_db).unwrap_or(Offset::BEGINNING))
}

/// Database row mapping
#[derive(sqlx::FromRow)]
struct EventEnvelopeRow {
    event_id: Uuid,
    seq: i64,
    entity_id: String,
    payload: serde_json::Value,
    occurred_at: DateTime<Utc>,
    persisted_at: DateTime<Utc>,
}

impl EventEnvelopeRow {
    fn into_envelope(self, tag: &Tag) -> Result<EventEnvelope> {
        let offset = offset_from_db(self.seq);
        let event: HelloEvent =
            serde_json::from_value(self.payload).map_err(|e| EventLogError::Corrupt {
                tag: tag.clone(),
                offset,
                reason: e.to_string(),
            })?;

        Ok(EventEnvelope {
            event_id: self.event_id,
            entity_id: self.entity_id,
            tag: tag.clone(),
            offset,
            event,
            occurred_at: self.occurred_at,
            persisted_at: self.persisted_at,
        })
    }
}
