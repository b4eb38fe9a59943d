//! Read-Side Projector
//!
//! Applies events from the tagged event log to the greetings read model.
//! This is the read side of Event Sourcing: each tag partition is owned by
//! one worker at a time, and every event is committed together with its
//! offset so replays after a crash are harmless.

pub mod backoff;
pub mod error;
pub mod handlers;
pub mod projector;
pub mod registry;

pub use backoff::RetryPolicy;
pub use error::{HandlerError, ProjectionError, Result};
pub use handlers::greetings::greetings_registry;
pub use projector::{
    prepare, HoldOutcome, PartitionOutcome, PartitionStatus, Projector, ProjectorConfig,
    ProjectorState, StopReason,
};
pub use registry::{Dispatch, Handler, HandlerRegistry};
