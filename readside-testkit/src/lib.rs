//! Test helpers for read-side tests.
//!
//! Provides event builders, log seeding, fault-injecting wrappers around the
//! event log and the store, and proptest strategies.

mod faults;
mod fixtures;

pub use faults::{FlakyEventLog, ScriptedStore};
pub use fixtures::{
    envelope, hello_event_strategy, seed_events, single_tag_log, wait_for, TEST_TAG,
};
