//! Event log ports and the per-tag subscription stream

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::Stream;
use readside_domain::{HelloEvent, Offset, Tag};
use tracing::trace;

use crate::types::{EventEnvelope, EventLogError, LogItem, Result};

/// Read access to a tagged event log.
///
/// Implementations:
/// - `MemoryEventLog` - in-process log, wakes readers on append
/// - `PgEventLog` - PostgreSQL `event_log` table (feature `postgres`)
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Events of `tag` with offset strictly greater than `after`, ascending,
    /// at most `limit` of them.
    async fn read_batch(&self, tag: &Tag, after: Offset, limit: usize)
        -> Result<Vec<EventEnvelope>>;

    /// Highest offset written to `tag` (`Offset::BEGINNING` if none).
    async fn head(&self, tag: &Tag) -> Result<Offset>;

    /// Suspend until an event beyond `after` may exist, or `max_wait` elapses.
    ///
    /// Spurious wake-ups are allowed; callers re-read afterwards.
    async fn wait_for_append(&self, tag: &Tag, after: Offset, max_wait: Duration) -> Result<()> {
        let _ = (tag, after);
        tokio::time::sleep(max_wait).await;
        Ok(())
    }
}

/// Write access used to persist events (stand-in for the write side).
#[async_trait]
pub trait EventWriter: Send + Sync {
    /// Persist `event` under the tag of its entity and return its envelope.
    async fn append(&self, event: HelloEvent) -> Result<EventEnvelope>;
}

/// Tuning for [`subscribe`]
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Events fetched per read
    pub batch_size: usize,
    /// Longest wait between reads once caught up
    pub poll_interval: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { batch_size: 256, poll_interval: Duration::from_millis(500) }
    }
}

/// Open a lazy, never-ending subscription to `tag`, starting after `after`.
///
/// Events arrive in offset order. Each time the reader reaches the log head
/// it yields one `LogItem::CaughtUp` and then waits for new appends.
///
/// The first error ends the stream. Restart by subscribing again from the
/// last offset the caller has durably processed.
///
/// # Errors
/// - `InvalidOffset` if `after` is beyond the current head
/// - `LogUnavailable` on storage failures
pub fn subscribe<L>(
    log: Arc<L>,
    tag: Tag,
    after: Offset,
    options: SubscribeOptions,
) -> impl Stream<Item = Result<LogItem>> + Send + 'static
where
    L: EventLog + ?Sized + 'static,
{
    let batch_size = options.batch_size.max(1);

    try_stream! {
        let head = log.head(&tag).await?;
        if after > head {
            Err::<(), _>(EventLogError::InvalidOffset { tag: tag.clone(), offset: after, head })?;
        }

        let mut cursor = after;
        let mut announced = false;

        loop {
            let batch = log.read_batch(&tag, cursor, batch_size).await?;
            let full = batch.len() >= batch_size;

            for envelope in batch {
                cursor = envelope.offset;
                announced = false;
                yield LogItem::Event(envelope);
            }

            if !full {
                if !announced {
                    announced = true;
                    yield LogItem::CaughtUp { head: cursor };
                }
                trace!(tag = %tag, offset = %cursor, "Waiting for new events");
                log.wait_for_append(&tag, cursor, options.poll_interval).await?;
            }
        }
    }
}
