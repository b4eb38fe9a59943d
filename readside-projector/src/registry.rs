//! Event handler registry
//!
//! Routes each event kind to at most one handler. Kinds without a handler
//! are skipped, not errors.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use readside_domain::EventKind;
use readside_eventlog::EventEnvelope;
use readside_store::WriteBatch;

use crate::error::{HandlerError, ProjectionError, Result};

/// Pure function from an event to the mutations it implies
pub type Handler =
    Arc<dyn Fn(&EventEnvelope) -> std::result::Result<WriteBatch, HandlerError> + Send + Sync>;

/// What to do with one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Commit this batch with the event offset
    Apply(WriteBatch),
    /// No handler: commit only the offset
    Skip,
}

/// Handlers keyed by event kind, built once at startup
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<EventKind, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`.
    ///
    /// # Errors
    /// `DuplicateHandler` if `kind` already has a handler.
    pub fn register<F>(&mut self, kind: EventKind, handler: F) -> Result<()>
    where
        F: Fn(&EventEnvelope) -> std::result::Result<WriteBatch, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        if self.handlers.contains_key(&kind) {
            return Err(ProjectionError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, Arc::new(handler));
        Ok(())
    }

    /// Run the handler registered for the event's kind, if any
    pub fn dispatch(&self, envelope: &EventEnvelope) -> std::result::Result<Dispatch, HandlerError> {
        match self.handlers.get(&envelope.kind()) {
            Some(handler) => handler(envelope).map(Dispatch::Apply),
            None => Ok(Dispatch::Skip),
        }
    }

    pub fn is_registered(&self, kind: EventKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Registered kinds in declaration order
    pub fn kinds(&self) -> Vec<EventKind> {
        EventKind::ALL.iter().copied().filter(|k| self.is_registered(*k)).collect()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry").field("kinds", &self.kinds()).finish()
    }
}
