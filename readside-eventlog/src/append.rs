//! Event Appending with per-tag offset allocation

use chrono::{DateTime, Utc};
use readside_domain::{AggregateEventTag, HelloEvent, Offset, Tag};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::types::{EventEnvelope, Result};

/// Append event to the log under the tag of its entity
///
/// # Arguments
/// * `pool` - Database connection pool
/// * `tags` - Shard set used to pick the tag
/// * `event` - Event to append
///
/// # Returns
/// Envelope of the appended event, including its offset
///
/// # Errors
/// - `LogUnavailable` on SQL errors
/// - `Serialization` if the event cannot be encoded
pub async fn append_event(
    pool: &PgPool,
    tags: &AggregateEventTag,
    event: HelloEvent,
) -> Result<EventEnvelope> {
    let mut tx = pool.begin().await?;
    let envelope = append_event_tx(&mut tx, tags, event).await?;
    tx.commit().await?;
    Ok(envelope)
}

/// Append event within an existing transaction
///
/// Offsets are allocated from `tag_state` under its row lock, so concurrent
/// appenders to the same tag commit in offset order.
pub async fn append_event_tx(
    tx: &mut Transaction<'_, Postgres>,
    tags: &AggregateEventTag,
    event: HelloEvent,
) -> Result<EventEnvelope> {
    let tag = tags.tag_for(event.entity_id());

    // 1. Allocate next offset (locks the tag row until commit)
    let offset = next_offset(tx, &tag).await?;

    // 2. Insert event
    let event_id = Uuid::now_v7();
    let payload = serde_json::to_value(&event)?;
    let persisted_at: DateTime<Utc> = sqlx::query_scalar(
        r#"
        INSERT INTO event_log (
            event_id, tag, seq, entity_id, event_type, payload, occurred_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING persisted_at
        "#,
    )
    .bind(event_id)
    .bind(tag.as_str())
    .bind(offset.value())
    .bind(event.entity_id())
    .bind(event.kind().as_str())
    .bind(&payload)
    .bind(event.timestamp())
    .fetch_one(&mut **tx)
    .await?;

    debug!(
        event_id = %event_id,
        tag = %tag,
        offset = %offset,
        kind = %event.kind(),
        "Event appended"
    );

    Ok(EventEnvelope {
        event_id,
        entity_id: event.entity_id().to_string(),
        tag,
        offset,
        occurred_at: event.timestamp(),
        persisted_at,
        event,
    })
}

/// Allocate the next offset of a tag
async fn next_offset(tx: &mut Transaction<'_, Postgres>, tag: &Tag) -> Result<Offset> {
    let seq: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO tag_state (tag, last_seq) VALUES ($1, 1)
        ON CONFLICT (tag) DO UPDATE SET last_seq = tag_state.last_seq + 1, updated_at = NOW()
        RETURNING last_seq
        "#,
    )
    .bind(tag.as_str())
    .fetch_one(&mut **tx)
    .await?;

    Ok(offset_from_db(seq))
}

/// Convert a stored sequence number, clamping corrupt negatives to the sentinel
pub(crate) fn offset_from_db(seq: i64) -> Offset {
    Offset::new(seq).unwrap_or(Offset::BEGINNING)
}
