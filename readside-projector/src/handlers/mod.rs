//! Projection handlers for each read model

pub mod greetings;
