//! Event Log Module
//!
//! Provides the read side's view of the append-only event log:
//! - Per-tag offsets assigned at persist time
//! - Ordered, lazy, restartable subscriptions per tag
//! - In-memory log for tests and PostgreSQL log (feature `postgres`)
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use futures_util::StreamExt;
//! use readside_domain::{AggregateEventTag, HelloEvent, Offset};
//! use readside_eventlog::{subscribe, EventWriter, LogItem, MemoryEventLog, SubscribeOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let tags = AggregateEventTag::sharded("HelloEvent", 4)?;
//! let log = Arc::new(MemoryEventLog::new(tags.clone()));
//!
//! log.append(HelloEvent::greeting_changed("alice", "hi")).await?;
//!
//! let tag = tags.tag_for("alice");
//! let mut events = Box::pin(subscribe(log, tag, Offset::BEGINNING, SubscribeOptions::default()));
//! while let Some(item) = events.next().await {
//!     if let LogItem::Event(envelope) = item? {
//!         println!("{} @ {}", envelope.kind(), envelope.offset);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod reader;
pub mod types;

#[cfg(feature = "postgres")]
pub mod append;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "postgres")]
pub mod query;

pub use memory::MemoryEventLog;
pub use reader::{subscribe, EventLog, EventWriter, SubscribeOptions};
pub use types::{EventEnvelope, EventLogError, LogItem, Result};

#[cfg(feature = "postgres")]
pub use append::{append_event, append_event_tx};
#[cfg(feature = "postgres")]
pub use postgres::PgEventLog;
#[cfg(feature = "postgres")]
pub use query::{query_tag_events, query_tag_head};
