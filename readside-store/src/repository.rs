//! Repository trait definitions (Ports)
//!
//! These traits define the storage interface for the read side.
//! Implementations can be PostgreSQL or in-memory for testing.

use std::time::Duration;

use crate::error::StoreError;
use async_trait::async_trait;
use readside_domain::{Lease, Offset, Tag, UserGreeting, WorkerId};

// =============================================================================
// Write batches
// =============================================================================

/// One read-model mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowMutation {
    /// Insert the row or replace the message of an existing one
    UpsertGreeting(UserGreeting),
    /// Remove the row if present
    DeleteGreeting {
        /// User id
        id: String,
    },
}

/// Ordered list of mutations applied atomically with an offset update.
///
/// An empty batch is valid: it only advances the offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    mutations: Vec<RowMutation>,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a mutation
    pub fn push(&mut self, mutation: RowMutation) {
        self.mutations.push(mutation);
    }

    /// Builder form of an upsert
    pub fn upsert_greeting(mut self, greeting: UserGreeting) -> Self {
        self.push(RowMutation::UpsertGreeting(greeting));
        self
    }

    /// Builder form of a delete
    pub fn delete_greeting(mut self, id: impl Into<String>) -> Self {
        self.push(RowMutation::DeleteGreeting { id: id.into() });
        self
    }

    /// True if the batch carries no mutation
    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Number of mutations
    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Mutations in application order
    pub fn mutations(&self) -> &[RowMutation] {
        &self.mutations
    }
}

impl IntoIterator for WriteBatch {
    type Item = RowMutation;
    type IntoIter = std::vec::IntoIter<RowMutation>;

    fn into_iter(self) -> Self::IntoIter {
        self.mutations.into_iter()
    }
}

impl FromIterator<RowMutation> for WriteBatch {
    fn from_iter<I: IntoIterator<Item = RowMutation>>(iter: I) -> Self {
        Self { mutations: iter.into_iter().collect() }
    }
}

// =============================================================================
// Offsets and read model
// =============================================================================

/// Durable per-tag progress, committed together with read-model mutations
#[async_trait]
pub trait OffsetStore: Send + Sync {
    /// Create the offset and read-model tables if absent (idempotent)
    async fn init_schema(&self) -> Result<(), StoreError>;

    /// Last committed offset of `tag`, `None` if nothing was ever committed
    async fn load(&self, tag: &Tag) -> Result<Option<Offset>, StoreError>;

    /// Apply `batch` and move the offset of `tag` from `expected` to `new`,
    /// all or nothing.
    ///
    /// # Errors
    /// - `NonMonotonicOffset` if `new` is not past `expected`
    /// - `StaleOffset` if the stored offset is not `expected`
    async fn commit(
        &self,
        tag: &Tag,
        expected: Option<Offset>,
        new: Offset,
        batch: WriteBatch,
    ) -> Result<(), StoreError>;
}

/// Queries over the greetings read model
#[async_trait]
pub trait GreetingRepository: Send + Sync {
    /// Find a greeting by user id
    async fn find_greeting(&self, id: &str) -> Result<Option<UserGreeting>, StoreError>;

    /// All greetings ordered by id
    async fn all_greetings(&self) -> Result<Vec<UserGreeting>, StoreError>;
}

/// Combined store interface
pub trait Store: OffsetStore + GreetingRepository {}

impl<T: OffsetStore + GreetingRepository + ?Sized> Store for T {}

/// Shared precondition of every `commit` implementation
pub(crate) fn check_monotonic(
    tag: &Tag,
    expected: Option<Offset>,
    new: Offset,
) -> Result<(), StoreError> {
    if new <= expected.unwrap_or(Offset::BEGINNING) {
        return Err(StoreError::NonMonotonicOffset { tag: tag.clone(), expected, new });
    }
    Ok(())
}

// =============================================================================
// Partition coordination
// =============================================================================

/// Result of a lease request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// The caller now owns the tag
    Acquired(Lease),
    /// Another worker holds a live lease
    Busy {
        /// Current owner
        holder: WorkerId,
    },
}

/// Result of a lease renewal
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenewOutcome {
    /// Expiry pushed out by the lease ttl
    Renewed(Lease),
    /// The lease lapsed or was taken over; the caller must stop
    Expired,
}

/// Assigns tags to workers through expiring leases.
///
/// At most one live lease exists per tag at any instant. A worker that stops
/// renewing loses the tag once the ttl elapses.
#[async_trait]
pub trait PartitionCoordinator: Send + Sync {
    /// Claim `tag` for `worker_id` unless another worker holds a live lease.
    ///
    /// A worker re-acquiring its own live lease gets a fresh grant.
    async fn acquire(
        &self,
        tag: &Tag,
        worker_id: &WorkerId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, StoreError>;

    /// Extend a lease that is still live and still carries the same token
    async fn renew(&self, lease: &Lease) -> Result<RenewOutcome, StoreError>;

    /// Drop the lease if the token still matches; no-op otherwise
    async fn release(&self, lease: &Lease) -> Result<(), StoreError>;

    /// Live leases, ordered by tag
    async fn leases(&self) -> Result<Vec<Lease>, StoreError>;
}
