//! Builders and seeding helpers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use proptest::prelude::*;
use readside_domain::{AggregateEventTag, HelloEvent, Offset, Tag};
use readside_eventlog::{EventEnvelope, EventWriter, MemoryEventLog};
use tokio::sync::watch;
use uuid::Uuid;

/// Tag used by [`envelope`] and [`single_tag_log`]
pub const TEST_TAG: &str = "HelloEvent0";

/// Build an envelope at `offset` on [`TEST_TAG`] without going through a log.
pub fn envelope(offset: i64, event: HelloEvent) -> EventEnvelope {
    EventEnvelope {
        event_id: Uuid::now_v7(),
        entity_id: event.entity_id().to_string(),
        tag: Tag::new(TEST_TAG).expect("valid test tag"),
        offset: Offset::new(offset).expect("non-negative test offset"),
        occurred_at: event.timestamp(),
        persisted_at: Utc::now(),
        event,
    }
}

/// In-memory log with a single shard, so every entity lands on [`TEST_TAG`].
pub fn single_tag_log() -> (Arc<MemoryEventLog>, Tag) {
    let tags = AggregateEventTag::sharded("HelloEvent", 1).expect("one shard is valid");
    let tag = Tag::new(TEST_TAG).expect("valid test tag");
    (Arc::new(MemoryEventLog::new(tags)), tag)
}

/// Append `events` in order and return their envelopes.
pub async fn seed_events<W>(
    log: &W,
    events: impl IntoIterator<Item = HelloEvent>,
) -> Result<Vec<EventEnvelope>>
where
    W: EventWriter + ?Sized,
{
    let mut envelopes = Vec::new();
    for event in events {
        envelopes.push(log.append(event).await?);
    }
    Ok(envelopes)
}

/// Wait until the watched value satisfies `predicate`, failing after 10s.
pub async fn wait_for<T, F>(rx: &mut watch::Receiver<T>, mut predicate: F) -> Result<T>
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    let value = tokio::time::timeout(Duration::from_secs(10), rx.wait_for(|v| predicate(v)))
        .await
        .map_err(|_| anyhow::anyhow!("condition not reached within 10s"))??;
    Ok(value.clone())
}

/// Events over a handful of users, mixing every kind.
///
/// Names and messages stay within the read-model column widths.
pub fn hello_event_strategy() -> impl Strategy<Value = HelloEvent> {
    let name = prop::sample::select(vec!["alice", "bob", "carol", "dave"]);
    prop_oneof![
        4 => (name.clone(), "[a-z]{1,12}")
            .prop_map(|(name, message)| HelloEvent::greeting_changed(name, message)),
        1 => name.clone().prop_map(|name| HelloEvent::greeting_cleared(name)),
        1 => name.prop_map(|name| HelloEvent::hello_said(name)),
    ]
}
