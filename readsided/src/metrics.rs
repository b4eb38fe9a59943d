//! Prometheus metrics for the partitions of this worker.
//!
//! Values are refreshed from [`PartitionStatus`] snapshots right before each
//! scrape, so the projector itself stays free of metrics code.

use std::sync::Mutex;

use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use readside_projector::{PartitionStatus, ProjectorState};

use crate::error::{DaemonError, DaemonResult};

/// Per-tag projection metrics.
pub struct ProjectionMetrics {
    registry: Registry,
    offset: IntGaugeVec,
    owned: IntGaugeVec,
    faulted: IntGaugeVec,
    applied: IntCounterVec,
    skipped: IntCounterVec,
    retries: IntCounterVec,
    /// Serializes the counter catch-up in `observe` across concurrent scrapes
    catch_up: Mutex<()>,
}

impl ProjectionMetrics {
    pub fn new() -> DaemonResult<Self> {
        let registry = Registry::new_custom(Some("readside".to_string()), None)?;

        let offset = IntGaugeVec::new(
            Opts::new("partition_offset", "Last committed offset per tag"),
            &["tag"],
        )?;
        let owned = IntGaugeVec::new(
            Opts::new("partition_owned", "1 while this worker holds the tag's lease"),
            &["tag"],
        )?;
        let faulted = IntGaugeVec::new(
            Opts::new("partition_faulted", "1 while the tag is faulted"),
            &["tag"],
        )?;
        let applied = IntCounterVec::new(
            Opts::new("events_applied_total", "Events applied to the read model"),
            &["tag"],
        )?;
        let skipped = IntCounterVec::new(
            Opts::new("events_skipped_total", "Events without a handler"),
            &["tag"],
        )?;
        let retries = IntCounterVec::new(
            Opts::new("apply_retries_total", "Retried apply attempts"),
            &["tag"],
        )?;

        registry.register(Box::new(offset.clone()))?;
        registry.register(Box::new(owned.clone()))?;
        registry.register(Box::new(faulted.clone()))?;
        registry.register(Box::new(applied.clone()))?;
        registry.register(Box::new(skipped.clone()))?;
        registry.register(Box::new(retries.clone()))?;

        Ok(Self {
            registry,
            offset,
            owned,
            faulted,
            applied,
            skipped,
            retries,
            catch_up: Mutex::new(()),
        })
    }

    /// Bring every series of `status.tag` up to date.
    pub fn observe(&self, status: &PartitionStatus) {
        let tag = status.tag.as_str();

        self.offset
            .with_label_values(&[tag])
            .set(status.offset.map(|o| o.value()).unwrap_or(0));
        self.owned.with_label_values(&[tag]).set(match status.state {
            ProjectorState::CatchingUp | ProjectorState::Live | ProjectorState::Faulted => 1,
            _ => 0,
        });
        self.faulted
            .with_label_values(&[tag])
            .set(i64::from(status.state == ProjectorState::Faulted));

        // Status totals only grow; counters catch up by the difference.
        let _guard = self.catch_up.lock().unwrap_or_else(|e| e.into_inner());
        for (counter, total) in [
            (&self.applied, status.events_applied),
            (&self.skipped, status.events_skipped),
            (&self.retries, status.retries),
        ] {
            let counter = counter.with_label_values(&[tag]);
            let seen = counter.get();
            if total > seen {
                counter.inc_by(total - seen);
            }
        }
    }

    /// Prometheus text exposition of all metrics.
    pub fn render(&self) -> DaemonResult<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| DaemonError::Metrics(e.to_string()))
    }
}

// =============================================================================
// Tests
// =============================================================================
