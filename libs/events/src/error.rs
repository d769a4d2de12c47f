//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when handling events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event type has no registered decoder.
    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    /// The aggregate type is not one this service knows.
    #[error("unknown aggregate type: {0}")]
    UnknownAggregateType(String),

    /// The event payload could not be decoded into its registered type.
    #[error("invalid event payload for {event_type}: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Reconstruction was attempted without any events.
    #[error("no events to reconstruct from")]
    EmptyHistory,

    /// The history skips or repeats a version.
    #[error("wrong event version: expected {expected}, got {actual}")]
    VersionGap { expected: i32, actual: i32 },

    /// The history mixes events of different aggregates.
    #[error("event for aggregate {actual} found in history of {expected}")]
    AggregateMismatch { expected: String, actual: String },
}

impl From<serde_json::Error> for EventError {
    fn from(err: serde_json::Error) -> Self {
        EventError::Serialization(err.to_string())
    }
}

/// Domain rule violations raised by the user aggregate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UserError {
    #[error("username must not be empty")]
    InvalidUsername,

    #[error("password must be at least {min} characters long")]
    PasswordTooShort { min: usize },

    #[error("user {0} has not been registered")]
    NotRegistered(String),
}
