//! Read-side domain layer
//!
//! Pure domain types with zero I/O dependencies: the hello aggregate's
//! events, tag partitions, offsets, leases and the greeting read-model row.

#![warn(missing_docs)]
#![warn(clippy::all)]

// Public modules
pub mod entities;
pub mod events;
pub mod value_objects;

// Re-export commonly used types
pub use entities::{Lease, UserGreeting, MAX_GREETING_ID_LEN, MAX_GREETING_MESSAGE_LEN};
pub use events::{EventKind, HelloEvent};
pub use value_objects::{AggregateEventTag, DomainError, Offset, Tag, WorkerId};
