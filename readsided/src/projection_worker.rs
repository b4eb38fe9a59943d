//! Projection worker: one supervisor task per tag partition.
//!
//! Each worker claims its tag whenever a partition permit is free, runs the
//! projector until it gives the tag up, and tries again after
//! `claim_interval`. A faulted partition keeps its lease until an operator
//! restarts it through [`PartitionBoard::restart`].

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use readside_domain::Tag;
use readside_projector::{
    HoldOutcome, PartitionOutcome, PartitionStatus, Projector, ProjectorState, RetryPolicy,
    StopReason,
};
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{DaemonError, DaemonResult};

// =============================================================================
// Partition board
// =============================================================================

/// Handle on one partition owned by this process.
#[derive(Clone)]
pub struct PartitionHandle {
    projector: Arc<Projector>,
    /// Restart sender of the current fault hold; empty when not holding
    restart: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl PartitionHandle {
    pub fn new(projector: Arc<Projector>) -> Self {
        Self { projector, restart: Arc::new(Mutex::new(None)) }
    }

    /// Open a restart channel for a new fault hold, replacing any older one.
    fn arm_restart(&self) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        *self.restart.lock().unwrap_or_else(|e| e.into_inner()) = Some(sender);
        receiver
    }

    fn disarm_restart(&self) {
        self.restart.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Hand a restart to the current fault hold. False if there is none.
    fn request_restart(&self) -> bool {
        let sender = self.restart.lock().unwrap_or_else(|e| e.into_inner()).take();
        sender.is_some_and(|sender| sender.send(()).is_ok())
    }

    pub fn projector(&self) -> &Arc<Projector> {
        &self.projector
    }

    pub fn status(&self) -> PartitionStatus {
        self.projector.status()
    }
}

/// Every partition of this process, keyed by tag.
#[derive(Clone, Default)]
pub struct PartitionBoard {
    partitions: BTreeMap<Tag, PartitionHandle>,
}

impl PartitionBoard {
    pub fn new(projectors: impl IntoIterator<Item = Arc<Projector>>) -> Self {
        let partitions = projectors
            .into_iter()
            .map(|p| (p.tag().clone(), PartitionHandle::new(p)))
            .collect();
        Self { partitions }
    }

    pub fn get(&self, tag: &Tag) -> Option<&PartitionHandle> {
        self.partitions.get(tag)
    }

    pub fn handles(&self) -> impl Iterator<Item = &PartitionHandle> {
        self.partitions.values()
    }

    /// Status of every partition, in tag order.
    pub fn statuses(&self) -> Vec<PartitionStatus> {
        self.partitions.values().map(PartitionHandle::status).collect()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// Ask a faulted partition to retry from its committed offset.
    ///
    /// The request goes to the fault hold running right now. It is never
    /// kept for a later fault.
    ///
    /// # Errors
    /// - `PartitionNotFound` if the tag is not one of ours
    /// - `PartitionNotFaulted` unless the partition is currently held faulted
    pub fn restart(&self, tag: &Tag) -> DaemonResult<()> {
        let handle =
            self.partitions.get(tag).ok_or_else(|| DaemonError::PartitionNotFound(tag.clone()))?;

        if !handle.request_restart() {
            let state = handle.status().state;
            let state = match state {
                // Faulted but not yet (or no longer) holding its lease
                ProjectorState::Faulted => "faulted, not holding",
                other => other.as_str(),
            };
            return Err(DaemonError::PartitionNotFaulted {
                tag: tag.clone(),
                state: state.to_string(),
            });
        }

        info!(%tag, "Partition restart requested");
        Ok(())
    }
}

// =============================================================================
// Worker
// =============================================================================

/// Supervisor loop for one tag.
pub struct ProjectionWorker {
    partition: PartitionHandle,
    permits: Arc<Semaphore>,
    claim_interval: Duration,
    /// Backoff for coordinator/store errors raised before processing starts
    retry: RetryPolicy,
}

impl ProjectionWorker {
    pub fn new(
        partition: PartitionHandle,
        permits: Arc<Semaphore>,
        claim_interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self { partition, permits, claim_interval, retry }
    }

    /// Run the worker loop.
    ///
    /// Returns when shutdown is signaled via cancellation token.
    pub async fn run(self, shutdown: CancellationToken) -> DaemonResult<()> {
        let tag = self.partition.projector.tag().clone();
        info!(
            %tag,
            claim_interval_ms = self.claim_interval.as_millis() as u64,
            "Projection worker started"
        );

        let mut failures = 0u32;
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => {
                    permit.map_err(|_| DaemonError::Shutdown)?
                }
            };

            let pause = self.own_partition(&shutdown, &mut failures).await;
            drop(permit);

            let Some(pause) = pause else { break };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(%tag, "Projection worker stopped");
        Ok(())
    }

    /// Project the tag until it is given up. Returns how long to wait before
    /// claiming again, or `None` on shutdown.
    async fn own_partition(
        &self,
        shutdown: &CancellationToken,
        failures: &mut u32,
    ) -> Option<Duration> {
        let projector = &self.partition.projector;
        let tag = projector.tag();

        loop {
            match projector.run(shutdown).await {
                Ok(PartitionOutcome::Busy { holder }) => {
                    *failures = 0;
                    debug!(%tag, %holder, "Partition owned elsewhere");
                    return Some(self.claim_interval);
                },
                Ok(PartitionOutcome::Stopped(StopReason::Cancelled)) => return None,
                Ok(PartitionOutcome::Stopped(reason)) => {
                    *failures = 0;
                    info!(%tag, ?reason, "Partition given up; will try to claim again");
                    return Some(self.claim_interval);
                },
                Ok(PartitionOutcome::Faulted { lease, error }) => {
                    warn!(%tag, %error, "Partition faulted; holding lease until restart");
                    let restart = self.partition.arm_restart();
                    let held = projector.hold_faulted(lease, shutdown, restart).await;
                    self.partition.disarm_restart();
                    match held {
                        HoldOutcome::Restart => {
                            *failures = 0;
                            info!(%tag, "Restarting faulted partition");
                        },
                        HoldOutcome::Stopped(StopReason::Cancelled) => return None,
                        HoldOutcome::Stopped(reason) => {
                            info!(%tag, ?reason, "Faulted partition lost its lease");
                            return Some(self.claim_interval);
                        },
                    }
                },
                Err(e) => {
                    *failures = failures.saturating_add(1);
                    let delay = self.retry.delay_for(*failures);
                    error!(
                        %tag,
                        error = %e,
                        attempt = *failures,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to claim partition (will retry)"
                    );
                    return Some(delay);
                },
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
