//! Read-Side Storage Layer
//!
//! Provides persistence for projection offsets, the greetings read model,
//! and partition leases.
//!
//! # Architecture
//!
//! - **Repository traits**: Define the storage interface (ports)
//! - **In-memory store**: Fast implementation for testing
//! - **PostgreSQL store**: Production implementation (feature `postgres`)
//!
//! # Usage
//!
//! ```rust
//! use readside_domain::{Offset, Tag, UserGreeting};
//! use readside_store::{GreetingRepository, MemoryStore, OffsetStore, WriteBatch};
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = MemoryStore::new();
//!     let tag = Tag::new("HelloEvent0").unwrap();
//!
//!     // Apply a row and advance the offset in one step
//!     let batch = WriteBatch::new().upsert_greeting(UserGreeting::new("alice", "hi"));
//!     store.commit(&tag, None, Offset::new(1).unwrap(), batch).await.unwrap();
//!
//!     let greeting = store.find_greeting("alice").await.unwrap();
//!     println!("alice says {:?}", greeting.map(|g| g.message));
//! }
//! ```

#![warn(clippy::all)]

// Modules
mod error;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;
mod repository;

// Re-exports
pub use error::StoreError;
pub use memory::{MemoryCoordinator, MemoryStore};
#[cfg(feature = "postgres")]
pub use postgres::{PgCoordinator, PgStore};
pub use repository::{
    AcquireOutcome, GreetingRepository, OffsetStore, PartitionCoordinator, RenewOutcome,
    RowMutation, Store, WriteBatch,
};
