//! Fault-injecting wrappers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use readside_domain::{Offset, Tag, UserGreeting};
use readside_eventlog::{EventEnvelope, EventLog, EventLogError};
use readside_store::{GreetingRepository, OffsetStore, StoreError, WriteBatch};

// =============================================================================
// FlakyEventLog
// =============================================================================

/// Event log whose next reads fail with `LogUnavailable`.
pub struct FlakyEventLog<L: ?Sized> {
    inner: Arc<L>,
    failures: AtomicUsize,
    reads: AtomicUsize,
}

impl<L: ?Sized> FlakyEventLog<L> {
    pub fn new(inner: Arc<L>) -> Self {
        Self { inner, failures: AtomicUsize::new(0), reads: AtomicUsize::new(0) }
    }

    /// Fail the next `n` calls to `head` or `read_batch`
    pub fn fail_next_reads(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Calls made so far, failed ones included
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), EventLogError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(EventLogError::LogUnavailable("injected read failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<L: EventLog + ?Sized> EventLog for FlakyEventLog<L> {
    async fn read_batch(
        &self,
        tag: &Tag,
        after: Offset,
        limit: usize,
    ) -> Result<Vec<EventEnvelope>, EventLogError> {
        self.check()?;
        self.inner.read_batch(tag, after, limit).await
    }

    async fn head(&self, tag: &Tag) -> Result<Offset, EventLogError> {
        self.check()?;
        self.inner.head(tag).await
    }

    async fn wait_for_append(
        &self,
        tag: &Tag,
        after: Offset,
        max_wait: Duration,
    ) -> Result<(), EventLogError> {
        self.inner.wait_for_append(tag, after, max_wait).await
    }
}

// =============================================================================
// ScriptedStore
// =============================================================================

/// Store wrapper that counts commits and can simulate a takeover or an outage.
///
/// Once armed with [`ScriptedStore::taken_over_at`], every commit of that
/// offset or a later one fails with `StaleOffset`, as if another worker had
/// committed it first.
pub struct ScriptedStore<S> {
    inner: S,
    commits: AtomicUsize,
    outages: AtomicUsize,
    taken_over_at: Mutex<Option<Offset>>,
}

impl<S> ScriptedStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            commits: AtomicUsize::new(0),
            outages: AtomicUsize::new(0),
            taken_over_at: Mutex::new(None),
        }
    }

    /// Fail the next `n` commits with `Unavailable` without touching the inner store
    pub fn fail_next_commits(&self, n: usize) {
        self.outages.store(n, Ordering::SeqCst);
    }

    pub fn taken_over_at(&self, offset: Offset) {
        *self.taken_over_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(offset);
    }

    /// Commit calls so far, rejected ones included
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: OffsetStore> OffsetStore for ScriptedStore<S> {
    async fn init_schema(&self) -> Result<(), StoreError> {
        self.inner.init_schema().await
    }

    async fn load(&self, tag: &Tag) -> Result<Option<Offset>, StoreError> {
        self.inner.load(tag).await
    }

    async fn commit(
        &self,
        tag: &Tag,
        expected: Option<Offset>,
        new: Offset,
        batch: WriteBatch,
    ) -> Result<(), StoreError> {
        self.commits.fetch_add(1, Ordering::SeqCst);

        let down = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if down {
            return Err(StoreError::Unavailable(format!("injected outage committing {}@{}", tag, new)));
        }

        let takeover = *self.taken_over_at.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(at) = takeover.filter(|at| new >= *at) {
            return Err(StoreError::StaleOffset { tag: tag.clone(), expected, actual: Some(at) });
        }
        self.inner.commit(tag, expected, new, batch).await
    }
}

#[async_trait]
impl<S: GreetingRepository> GreetingRepository for ScriptedStore<S> {
    async fn find_greeting(&self, id: &str) -> Result<Option<UserGreeting>, StoreError> {
        self.inner.find_greeting(id).await
    }

    async fn all_greetings(&self) -> Result<Vec<UserGreeting>, StoreError> {
        self.inner.all_greetings().await
    }
}
