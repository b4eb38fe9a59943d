//! Greetings projection handlers
//!
//! `user_greetings` holds one row per user id. A changed message upserts the
//! row, a cleared greeting deletes it, and `HelloSaid` has no effect.

use readside_domain::{
    EventKind, HelloEvent, UserGreeting, MAX_GREETING_ID_LEN, MAX_GREETING_MESSAGE_LEN,
};
use readside_eventlog::EventEnvelope;
use readside_store::WriteBatch;

use crate::error::{HandlerError, Result};
use crate::registry::HandlerRegistry;

/// Registry with every greetings handler
pub fn greetings_registry() -> Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(EventKind::GreetingMessageChanged, handle_greeting_message_changed)?;
    registry.register(EventKind::GreetingCleared, handle_greeting_cleared)?;
    Ok(registry)
}

pub fn handle_greeting_message_changed(
    envelope: &EventEnvelope,
) -> std::result::Result<WriteBatch, HandlerError> {
    let HelloEvent::GreetingMessageChanged { name, message, .. } = &envelope.event else {
        return Err(unexpected(EventKind::GreetingMessageChanged, envelope));
    };
    validate_id(name)?;

    let len = message.chars().count();
    if len > MAX_GREETING_MESSAGE_LEN {
        return Err(HandlerError::MessageTooLong {
            id: name.clone(),
            len,
            max: MAX_GREETING_MESSAGE_LEN,
        });
    }

    tracing::debug!(id = %name, offset = %envelope.offset, "GreetingMessageChanged -> upsert");
    Ok(WriteBatch::new().upsert_greeting(UserGreeting::new(name.clone(), message.clone())))
}

pub fn handle_greeting_cleared(
    envelope: &EventEnvelope,
) -> std::result::Result<WriteBatch, HandlerError> {
    let HelloEvent::GreetingCleared { name, .. } = &envelope.event else {
        return Err(unexpected(EventKind::GreetingCleared, envelope));
    };
    validate_id(name)?;

    tracing::debug!(id = %name, offset = %envelope.offset, "GreetingCleared -> delete");
    Ok(WriteBatch::new().delete_greeting(name.clone()))
}

fn validate_id(id: &str) -> std::result::Result<(), HandlerError> {
    if id.trim().is_empty() {
        return Err(HandlerError::InvalidId { id: id.to_string(), reason: "empty".to_string() });
    }
    let len = id.chars().count();
    if len > MAX_GREETING_ID_LEN {
        return Err(HandlerError::InvalidId {
            id: id.to_string(),
            reason: format!("{} characters, at most {} allowed", len, MAX_GREETING_ID_LEN),
        });
    }
    Ok(())
}

fn unexpected(expected: EventKind, envelope: &EventEnvelope) -> HandlerError {
    HandlerError::UnexpectedEvent { expected, actual: envelope.kind() }
}
