//! Per-tag read-side projector.
//!
//! One `Projector` owns the processing of one tag inside one worker:
//!
//! ```text
//! Idle -> Claiming -> CatchingUp <-> Live -> Stopped(reason)
//!            |             \           /
//!            v              `-> Faulted
//!          Idle (busy)
//! ```
//!
//! Each event is committed together with its offset. Handler and store
//! failures are retried with backoff, then fault the partition with the
//! offset preserved. A stale offset or a lost lease stops the projector
//! immediately. Log outages only cause a re-subscription.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use readside_domain::{Lease, Offset, Tag, WorkerId};
use readside_eventlog::{subscribe, EventEnvelope, EventLog, LogItem, SubscribeOptions};
use readside_store::{
    AcquireOutcome, OffsetStore, PartitionCoordinator, RenewOutcome, Store, StoreError, WriteBatch,
};
use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryPolicy;
use crate::error::{HandlerError, ProjectionError, Result};
use crate::registry::{Dispatch, HandlerRegistry};

// =============================================================================
// State & status
// =============================================================================

/// Why a projector gave up its partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Shutdown requested; the lease was released
    Cancelled,
    /// The lease expired or was taken over
    LeaseLost,
    /// Another worker committed for this tag
    StaleOffset,
}

/// Lifecycle state of one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectorState {
    Idle,
    Claiming,
    CatchingUp,
    Live,
    Stopped(StopReason),
    Faulted,
}

impl ProjectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectorState::Idle => "idle",
            ProjectorState::Claiming => "claiming",
            ProjectorState::CatchingUp => "catching_up",
            ProjectorState::Live => "live",
            ProjectorState::Stopped(_) => "stopped",
            ProjectorState::Faulted => "faulted",
        }
    }
}

/// Snapshot published on every transition and commit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionStatus {
    pub tag: Tag,
    pub state: ProjectorState,
    /// Last committed offset, as far as this worker knows
    pub offset: Option<Offset>,
    pub owner: Option<WorkerId>,
    pub events_applied: u64,
    pub events_skipped: u64,
    pub retries: u64,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl PartitionStatus {
    fn new(tag: Tag) -> Self {
        Self {
            tag,
            state: ProjectorState::Idle,
            offset: None,
            owner: None,
            events_applied: 0,
            events_skipped: 0,
            retries: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// How `Projector::run` ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionOutcome {
    /// Another worker owns the tag
    Busy { holder: WorkerId },
    /// The lease is gone (or released); the tag may be claimed again
    Stopped(StopReason),
    /// Processing halted on an event that cannot be applied. The lease is
    /// still held; pass it to [`Projector::hold_faulted`].
    Faulted { lease: Lease, error: String },
}

/// How `Projector::hold_faulted` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldOutcome {
    /// An operator asked to retry the partition
    Restart,
    Stopped(StopReason),
}

/// Timing and retry knobs of a projector
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    pub worker_id: WorkerId,
    pub lease_ttl: Duration,
    /// Must be well below `lease_ttl`
    pub renew_interval: Duration,
    pub retry: RetryPolicy,
    pub subscribe: SubscribeOptions,
}

impl ProjectorConfig {
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            lease_ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(3),
            retry: RetryPolicy::default(),
            subscribe: SubscribeOptions::default(),
        }
    }
}

/// Create the read-side schema. Must succeed before any event is applied.
pub async fn prepare<S: OffsetStore + ?Sized>(store: &S) -> Result<()> {
    store.init_schema().await.map_err(ProjectionError::SchemaInit)?;
    info!("Read-side schema prepared");
    Ok(())
}

// =============================================================================
// Projector
// =============================================================================

/// Internal: why event processing must leave the run loop
enum Halt {
    Stop(StopReason),
    Fault(String),
}

impl From<StopReason> for Halt {
    fn from(reason: StopReason) -> Self {
        Halt::Stop(reason)
    }
}

enum Failure {
    Handler(HandlerError),
    Store(StoreError),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Failure::Handler(e) => write!(f, "{}", e),
            Failure::Store(e) => write!(f, "{}", e),
        }
    }
}

/// Projector for one tag
pub struct Projector {
    tag: Tag,
    log: Arc<dyn EventLog>,
    store: Arc<dyn Store>,
    coordinator: Arc<dyn PartitionCoordinator>,
    registry: Arc<HandlerRegistry>,
    config: ProjectorConfig,
    status: watch::Sender<PartitionStatus>,
}

impl Projector {
    pub fn new(
        tag: Tag,
        log: Arc<dyn EventLog>,
        store: Arc<dyn Store>,
        coordinator: Arc<dyn PartitionCoordinator>,
        registry: Arc<HandlerRegistry>,
        config: ProjectorConfig,
    ) -> Self {
        let (status, _) = watch::channel(PartitionStatus::new(tag.clone()));
        Self { tag, log, store, coordinator, registry, config, status }
    }

    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// Follow status changes
    pub fn watch_status(&self) -> watch::Receiver<PartitionStatus> {
        self.status.subscribe()
    }

    /// Current status snapshot
    pub fn status(&self) -> PartitionStatus {
        self.status.borrow().clone()
    }

    fn publish(&self, update: impl FnOnce(&mut PartitionStatus)) {
        self.status.send_modify(|status| {
            update(status);
            status.updated_at = Utc::now();
        });
    }

    fn set_state(&self, state: ProjectorState) {
        self.publish(|s| s.state = state);
    }

    /// Claim the tag and project it until cancelled, stopped or faulted.
    ///
    /// # Errors
    /// Coordinator or store failures before processing starts. The lease,
    /// if any, has been released.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<PartitionOutcome> {
        self.set_state(ProjectorState::Claiming);

        let acquired = self
            .coordinator
            .acquire(&self.tag, &self.config.worker_id, self.config.lease_ttl)
            .await;
        let lease = match acquired {
            Ok(AcquireOutcome::Acquired(lease)) => lease,
            Ok(AcquireOutcome::Busy { holder }) => {
                debug!(tag = %self.tag, holder = %holder, "Partition busy");
                self.publish(|s| {
                    s.state = ProjectorState::Idle;
                    s.owner = Some(holder.clone());
                });
                return Ok(PartitionOutcome::Busy { holder });
            },
            Err(e) => {
                self.publish(|s| {
                    s.state = ProjectorState::Idle;
                    s.last_error = Some(e.to_string());
                });
                return Err(e.into());
            },
        };

        let committed = match self.store.load(&self.tag).await {
            Ok(committed) => committed,
            Err(e) => {
                self.release(&lease).await;
                self.publish(|s| {
                    s.state = ProjectorState::Idle;
                    s.owner = None;
                    s.last_error = Some(e.to_string());
                });
                return Err(e.into());
            },
        };

        info!(
            tag = %self.tag,
            worker = %self.config.worker_id,
            offset = %committed.unwrap_or(Offset::BEGINNING),
            "Partition claimed"
        );
        self.publish(|s| {
            s.state = ProjectorState::CatchingUp;
            s.owner = Some(lease.worker_id.clone());
            s.offset = committed;
        });

        let mut lease = lease;
        let mut renew = self.renew_ticker();

        match self.process(&mut lease, committed, cancel, &mut renew).await {
            Halt::Stop(reason) => {
                if reason != StopReason::LeaseLost {
                    self.release(&lease).await;
                }
                info!(tag = %self.tag, reason = ?reason, "Partition stopped");
                self.publish(|s| {
                    s.state = ProjectorState::Stopped(reason);
                    s.owner = None;
                });
                Ok(PartitionOutcome::Stopped(reason))
            },
            Halt::Fault(error) => {
                error!(tag = %self.tag, error = %error, "Partition faulted");
                self.publish(|s| {
                    s.state = ProjectorState::Faulted;
                    s.last_error = Some(error.clone());
                });
                Ok(PartitionOutcome::Faulted { lease, error })
            },
        }
    }

    /// Keep a faulted partition's lease alive until `restart` fires.
    ///
    /// No events are consumed meanwhile, so no other worker picks up the
    /// poisoned tag. The receiver belongs to this hold only; a dropped sender
    /// just leaves the partition faulted.
    pub async fn hold_faulted(
        &self,
        lease: Lease,
        cancel: &CancellationToken,
        mut restart: oneshot::Receiver<()>,
    ) -> HoldOutcome {
        let mut lease = lease;
        let mut renew = self.renew_ticker();
        let mut restartable = true;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.release(&lease).await;
                    self.publish(|s| {
                        s.state = ProjectorState::Stopped(StopReason::Cancelled);
                        s.owner = None;
                    });
                    return HoldOutcome::Stopped(StopReason::Cancelled);
                }
                requested = &mut restart, if restartable => {
                    if requested.is_err() {
                        restartable = false;
                        continue;
                    }
                    info!(tag = %self.tag, "Restarting faulted partition");
                    self.publish(|s| s.last_error = None);
                    return HoldOutcome::Restart;
                }
                _ = renew.tick() => {
                    if let Err(reason) = self.renew_lease(&mut lease).await {
                        self.publish(|s| {
                            s.state = ProjectorState::Stopped(reason);
                            s.owner = None;
                        });
                        return HoldOutcome::Stopped(reason);
                    }
                }
            }
        }
    }

    fn renew_ticker(&self) -> Interval {
        let mut ticker = interval(self.config.renew_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick is immediate; the lease was just granted.
        ticker.reset();
        ticker
    }

    async fn release(&self, lease: &Lease) {
        if let Err(e) = self.coordinator.release(lease).await {
            warn!(tag = %self.tag, error = %e, "Lease release failed; it will expire");
        }
    }

    async fn renew_lease(&self, lease: &mut Lease) -> std::result::Result<(), StopReason> {
        match self.coordinator.renew(lease).await {
            Ok(RenewOutcome::Renewed(renewed)) => {
                *lease = renewed;
                Ok(())
            },
            Ok(RenewOutcome::Expired) => {
                warn!(tag = %self.tag, "Lease expired");
                Err(StopReason::LeaseLost)
            },
            Err(e) => {
                // The lease outlives a missed renewal by up to its ttl.
                warn!(tag = %self.tag, error = %e, "Lease renewal failed (will retry)");
                Ok(())
            },
        }
    }

    /// Sleep for `delay` while still honoring cancellation and renewals
    async fn pause(
        &self,
        delay: Duration,
        lease: &mut Lease,
        cancel: &CancellationToken,
        renew: &mut Interval,
    ) -> std::result::Result<(), StopReason> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(StopReason::Cancelled),
                _ = renew.tick() => self.renew_lease(lease).await?,
                _ = &mut sleep => return Ok(()),
            }
        }
    }

    /// Subscribe and apply events until something halts processing
    async fn process(
        &self,
        lease: &mut Lease,
        mut committed: Option<Offset>,
        cancel: &CancellationToken,
        renew: &mut Interval,
    ) -> Halt {
        let mut reconnects: u32 = 0;

        loop {
            let from = committed.unwrap_or(Offset::BEGINNING);
            let stream = subscribe(
                self.log.clone(),
                self.tag.clone(),
                from,
                self.config.subscribe.clone(),
            );
            tokio::pin!(stream);

            let failure = loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Halt::Stop(StopReason::Cancelled),
                    _ = renew.tick() => {
                        if let Err(reason) = self.renew_lease(lease).await {
                            return Halt::Stop(reason);
                        }
                        continue;
                    }
                    item = stream.next() => item,
                };

                match item {
                    Some(Ok(LogItem::Event(envelope))) => {
                        reconnects = 0;
                        if let Err(halt) =
                            self.apply(envelope, &mut committed, lease, cancel, renew).await
                        {
                            return halt;
                        }
                    },
                    Some(Ok(LogItem::CaughtUp { head })) => {
                        reconnects = 0;
                        debug!(tag = %self.tag, head = %head, "Caught up");
                        self.set_state(ProjectorState::Live);
                    },
                    Some(Err(e)) if e.is_transient() => break e.to_string(),
                    Some(Err(e)) => return Halt::Fault(e.to_string()),
                    None => break "subscription ended".to_string(),
                }
            };

            reconnects = reconnects.saturating_add(1);
            let delay = self.config.retry.delay_for(reconnects);
            warn!(
                tag = %self.tag,
                error = %failure,
                attempt = reconnects,
                delay_ms = delay.as_millis() as u64,
                "Event log unavailable, re-subscribing"
            );
            self.publish(|s| {
                s.state = ProjectorState::CatchingUp;
                s.last_error = Some(failure);
            });

            if let Err(reason) = self.pause(delay, lease, cancel, renew).await {
                return Halt::Stop(reason);
            }
        }
    }

    /// Apply one event and commit its offset.
    ///
    /// Handler failures and permanent store errors are retried within the
    /// budget. An unavailable store is retried for as long as the lease holds.
    async fn apply(
        &self,
        envelope: EventEnvelope,
        committed: &mut Option<Offset>,
        lease: &mut Lease,
        cancel: &CancellationToken,
        renew: &mut Interval,
    ) -> std::result::Result<(), Halt> {
        let mut attempt: u32 = 0;
        let mut outages: u32 = 0;

        loop {
            let result = match self.registry.dispatch(&envelope) {
                Ok(Dispatch::Apply(batch)) => self
                    .store
                    .commit(&self.tag, *committed, envelope.offset, batch)
                    .await
                    .map(|_| true)
                    .map_err(Failure::Store),
                Ok(Dispatch::Skip) => self
                    .store
                    .commit(&self.tag, *committed, envelope.offset, WriteBatch::new())
                    .await
                    .map(|_| false)
                    .map_err(Failure::Store),
                Err(e) => Err(Failure::Handler(e)),
            };

            let failure = match result {
                Ok(applied) => {
                    *committed = Some(envelope.offset);
                    debug!(
                        tag = %self.tag,
                        offset = %envelope.offset,
                        kind = %envelope.kind(),
                        applied,
                        "Event committed"
                    );
                    self.publish(|s| {
                        s.offset = Some(envelope.offset);
                        if applied {
                            s.events_applied += 1;
                        } else {
                            s.events_skipped += 1;
                        }
                    });
                    return Ok(());
                },
                Err(Failure::Store(e)) if e.is_stale() => {
                    warn!(tag = %self.tag, error = %e, "Offset taken over by another worker");
                    return Err(Halt::Stop(StopReason::StaleOffset));
                },
                Err(failure) => failure,
            };

            let message = format!(
                "{} at offset {} ({}): {}",
                envelope.kind(),
                envelope.offset,
                envelope.event_id,
                failure
            );

            let delay = match &failure {
                Failure::Store(e) if e.is_transient() => {
                    outages = outages.saturating_add(1);
                    let delay = self.config.retry.delay_for(outages);
                    warn!(
                        tag = %self.tag,
                        offset = %envelope.offset,
                        outages,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Store unavailable, retrying commit"
                    );
                    delay
                },
                _ => {
                    attempt += 1;
                    if self.config.retry.is_exhausted(attempt) {
                        return Err(Halt::Fault(message));
                    }
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(
                        tag = %self.tag,
                        offset = %envelope.offset,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %failure,
                        "Failed to apply event (will retry)"
                    );
                    delay
                },
            };
            self.publish(|s| {
                s.retries += 1;
                s.last_error = Some(message);
            });

            self.pause(delay, lease, cancel, renew).await?;
        }
    }
}
