//! In-memory store implementation
//!
//! Used for testing and development without a database.
//! Commits stage the rows they touch and merge them only on success, so a
//! failure at any point leaves nothing applied.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use readside_domain::{Lease, Offset, Tag, UserGreeting, WorkerId};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::repository::{
    check_monotonic, AcquireOutcome, GreetingRepository, OffsetStore, PartitionCoordinator,
    RenewOutcome, RowMutation, WriteBatch,
};

// =============================================================================
// MemoryStore
// =============================================================================

#[derive(Debug, Clone, Default)]
struct MemoryState {
    offsets: HashMap<Tag, Offset>,
    greetings: BTreeMap<String, UserGreeting>,
}

/// In-memory offset store and read model
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    schema_ready: AtomicBool,
    /// Successful commits left before the injected failure; negative when disarmed
    fail_after: AtomicI64,
}

impl MemoryStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            schema_ready: AtomicBool::new(false),
            fail_after: AtomicI64::new(-1),
        }
    }

    /// Let `successes` commits through, then fail the next one after its row
    /// writes are staged and before the offset write, with a non-transient
    /// error as a crash would. The failed commit leaves no trace. One-shot;
    /// re-arming replaces the previous setting.
    pub fn fail_commit_after(&self, successes: usize) {
        self.fail_after.store(i64::try_from(successes).unwrap_or(i64::MAX), Ordering::SeqCst);
    }

    /// Cancel a pending `fail_commit_after`
    pub fn disarm(&self) {
        self.fail_after.store(-1, Ordering::SeqCst);
    }

    /// True once `init_schema` ran
    pub fn schema_ready(&self) -> bool {
        self.schema_ready.load(Ordering::SeqCst)
    }

    /// Number of greeting rows
    pub async fn greeting_count(&self) -> usize {
        self.state.lock().await.greetings.len()
    }

    /// Drop rows and offsets (useful for test setup and local rebuilds)
    pub async fn clear(&self) {
        *self.state.lock().await = MemoryState::default();
    }

    fn take_injected_failure(&self) -> bool {
        // 0 fires and disarms (-1); positive counts down; negative stays put.
        let previous = self
            .fail_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n >= 0).then_some(n - 1))
            .unwrap_or(-1);
        previous == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OffsetStore for MemoryStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        if !self.schema_ready.swap(true, Ordering::SeqCst) {
            debug!("In-memory schema initialized");
        }
        Ok(())
    }

    async fn load(&self, tag: &Tag) -> Result<Option<Offset>, StoreError> {
        Ok(self.state.lock().await.offsets.get(tag).copied())
    }

    async fn commit(
        &self,
        tag: &Tag,
        expected: Option<Offset>,
        new: Offset,
        batch: WriteBatch,
    ) -> Result<(), StoreError> {
        check_monotonic(tag, expected, new)?;

        let mut state = self.state.lock().await;

        let actual = state.offsets.get(tag).copied();
        if actual != expected {
            return Err(StoreError::StaleOffset { tag: tag.clone(), expected, actual });
        }

        // Only touched rows are staged; `None` marks a delete.
        let mut staged: BTreeMap<String, Option<UserGreeting>> = BTreeMap::new();
        for mutation in batch {
            match mutation {
                RowMutation::UpsertGreeting(greeting) => {
                    staged.insert(greeting.id.clone(), Some(greeting));
                },
                RowMutation::DeleteGreeting { id } => {
                    staged.insert(id, None);
                },
            }
        }

        if self.take_injected_failure() {
            warn!(tag = %tag, offset = %new, "Injected commit failure");
            return Err(StoreError::Database(format!(
                "injected failure committing {}@{}",
                tag, new
            )));
        }

        for (id, row) in staged {
            match row {
                Some(greeting) => {
                    state.greetings.insert(id, greeting);
                },
                None => {
                    state.greetings.remove(&id);
                },
            }
        }
        state.offsets.insert(tag.clone(), new);

        debug!(tag = %tag, offset = %new, "Committed");
        Ok(())
    }
}

#[async_trait]
impl GreetingRepository for MemoryStore {
    async fn find_greeting(&self, id: &str) -> Result<Option<UserGreeting>, StoreError> {
        Ok(self.state.lock().await.greetings.get(id).cloned())
    }

    async fn all_greetings(&self) -> Result<Vec<UserGreeting>, StoreError> {
        Ok(self.state.lock().await.greetings.values().cloned().collect())
    }
}

// =============================================================================
// MemoryCoordinator
// =============================================================================

struct LeaseEntry {
    lease: Lease,
    expires_at: Instant,
}

/// In-memory partition coordinator.
///
/// Expiry uses `tokio::time::Instant`, so paused-time tests can advance it.
#[derive(Default)]
pub struct MemoryCoordinator {
    leases: Mutex<HashMap<Tag, LeaseEntry>>,
}

impl MemoryCoordinator {
    /// Create a coordinator with no leases
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PartitionCoordinator for MemoryCoordinator {
    async fn acquire(
        &self,
        tag: &Tag,
        worker_id: &WorkerId,
        ttl: Duration,
    ) -> Result<AcquireOutcome, StoreError> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        if let Some(entry) = leases.get(tag) {
            if entry.expires_at > now && !entry.lease.is_held_by(worker_id) {
                return Ok(AcquireOutcome::Busy { holder: entry.lease.worker_id.clone() });
            }
        }

        let lease = Lease::grant(tag.clone(), worker_id.clone(), ttl);
        leases.insert(tag.clone(), LeaseEntry { lease: lease.clone(), expires_at: now + ttl });

        debug!(tag = %tag, worker = %worker_id, "Lease acquired");
        Ok(AcquireOutcome::Acquired(lease))
    }

    async fn renew(&self, lease: &Lease) -> Result<RenewOutcome, StoreError> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();

        match leases.get_mut(&lease.tag) {
            Some(entry) if entry.lease.token == lease.token && entry.expires_at > now => {
                entry.expires_at = now + entry.lease.ttl;
                Ok(RenewOutcome::Renewed(entry.lease.clone()))
            },
            _ => Ok(RenewOutcome::Expired),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<(), StoreError> {
        let mut leases = self.leases.lock().await;
        if leases.get(&lease.tag).is_some_and(|e| e.lease.token == lease.token) {
            leases.remove(&lease.tag);
            debug!(tag = %lease.tag, worker = %lease.worker_id, "Lease released");
        }
        Ok(())
    }

    async fn leases(&self) -> Result<Vec<Lease>, StoreError> {
        let leases = self.leases.lock().await;
        let now = Instant::now();

        let mut live: Vec<Lease> =
            leases.values().filter(|e| e.expires_at > now).map(|e| e.lease.clone()).collect();
        live.sort_by(|a, b| a.tag.as_str().cmp(b.tag.as_str()));
        Ok(live)
    }
}

// =============================================================================
// Tests
// =============================================================================
