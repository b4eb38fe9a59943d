//! In-memory event log
//!
//! Used for testing and development without a database.
//! Readers waiting at the head are woken through a `Notify` on every append.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use readside_domain::{AggregateEventTag, HelloEvent, Offset, Tag};
use tokio::sync::{Notify, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::reader::{EventLog, EventWriter};
use crate::types::{EventEnvelope, Result};

/// In-memory tagged event log
pub struct MemoryEventLog {
    tags: AggregateEventTag,
    streams: RwLock<HashMap<Tag, Vec<EventEnvelope>>>,
    appended: Notify,
}

impl MemoryEventLog {
    /// Create an empty log over the given shard set
    pub fn new(tags: AggregateEventTag) -> Self {
        Self { tags, streams: RwLock::new(HashMap::new()), appended: Notify::new() }
    }

    /// Shard set used to tag appended events
    pub fn tags(&self) -> &AggregateEventTag {
        &self.tags
    }

    /// Total number of events across all tags
    pub async fn event_count(&self) -> usize {
        self.streams.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl EventWriter for MemoryEventLog {
    async fn append(&self, event: HelloEvent) -> Result<EventEnvelope> {
        let tag = self.tags.tag_for(event.entity_id());

        let envelope = {
            let mut streams = self.streams.write().await;
            let stream = streams.entry(tag.clone()).or_default();
            let offset = stream.last().map(|e| e.offset).unwrap_or(Offset::BEGINNING).next();

            let envelope = EventEnvelope {
                event_id: Uuid::now_v7(),
                entity_id: event.entity_id().to_string(),
                tag,
                offset,
                occurred_at: event.timestamp(),
                persisted_at: Utc::now(),
                event,
            };
            stream.push(envelope.clone());
            envelope
        };

        debug!(
            tag = %envelope.tag,
            offset = %envelope.offset,
            kind = %envelope.kind(),
            "Event appended"
        );
        self.appended.notify_waiters();

        Ok(envelope)
    }
}

#[async_trait]
impl EventLog for MemoryEventLog {
    async fn read_batch(
        &self,
        tag: &Tag,
        after: Offset,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>> {
        let streams = self.streams.read().await;
        let Some(stream) = streams.get(tag) else {
            return Ok(Vec::new());
        };

        // Offsets are dense and start at 1, so offset n lives at index n - 1.
        let start = (after.value() as usize).min(stream.len());
        Ok(stream[start..].iter().take(limit).cloned().collect())
    }

    async fn head(&self, tag: &Tag) -> Result<Offset> {
        let streams = self.streams.read().await;
        Ok(streams
            .get(tag)
            .and_then(|s| s.last())
            .map(|e| e.offset)
            .unwrap_or(Offset::BEGINNING))
    }

    async fn wait_for_append(&self, tag: &Tag, after: Offset, max_wait: Duration) -> Result<()> {
        let notified = self.appended.notified();
        tokio::pin!(notified);
        // Register before checking the head so an append in between is not missed.
        notified.as_mut().enable();

        if self.head(tag).await? > after {
            return Ok(());
        }

        let _ = tokio::time::timeout(max_wait, notified).await;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn single_tag_log() -> MemoryEventLog {
        MemoryEventLog::new(AggregateEventTag::sharded("HelloEvent", 1).unwrap())
    }

    fn tag0() -> Tag {
        Tag::new("HelloEvent0").unwrap()
    }

    #[tokio::test]
    async fn test_append_assigns_dense_offsets_per_tag() {
        let log = single_tag_log();

        let e1 = log.append(HelloEvent::greeting_changed("alice", "hi")).await.unwrap();
        let e2 = log.append(HelloEvent::greeting_changed("bob", "yo")).await.unwrap();

        assert_eq!(e1.offset.value(), 1);
        assert_eq!(e2.offset.value(), 2);
        assert_eq!(e1.tag, tag0());
        assert_eq!(log.head(&tag0()).await.unwrap().value(), 2);
    }

    #[tokio::test]
    async fn test_read_batch_is_exclusive_and_limited() {
        let log = single_tag_log();
        for i in 0..5 {
            log.append(HelloEvent::greeting_changed("alice", format!("m{}", i))).await.unwrap();
        }

        let after_two = log.read_batch(&tag0(), Offset::new(2).unwrap(), 10).await.unwrap();
        let offsets: Vec<i64> = after_two.iter().map(|e| e.offset.value()).collect();
        assert_eq!(offsets, vec![3, 4, 5]);

        let limited = log.read_batch(&tag0(), Offset::BEGINNING, 2).await.unwrap();
        assert_eq!(limited.len(), 2);

        let past_head = log.read_batch(&tag0(), Offset::new(9).unwrap(), 10).await.unwrap();
        assert!(past_head.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_tag_is_empty() {
        let log = single_tag_log();
        let other = Tag::new("Other0").unwrap();

        assert_eq!(log.head(&other).await.unwrap(), Offset::BEGINNING);
        assert!(log.read_batch(&other, Offset::BEGINNING, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wait_for_append_wakes_on_append() {
        let log = Arc::new(single_tag_log());

        let waiter = {
            let log = log.clone();
            tokio::spawn(async move {
                log.wait_for_append(&tag0(), Offset::BEGINNING, Duration::from_secs(30)).await
            })
        };

        tokio::task::yield_now().await;
        log.append(HelloEvent::hello_said("alice")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should wake on append")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_for_append_returns_immediately_when_behind() {
        let log = single_tag_log();
        log.append(HelloEvent::hello_said("alice")).await.unwrap();

        tokio::time::timeout(
            Duration::from_secs(5),
            log.wait_for_append(&tag0(), Offset::BEGINNING, Duration::from_secs(30)),
        )
        .await
        .expect("should not wait when events are already available")
        .unwrap();
    }
}
