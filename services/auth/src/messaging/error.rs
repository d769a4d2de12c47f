//! Broker and message processing errors.

use dcart_events::EventError;

use crate::projections::ProjectionError;

/// Errors talking to the broker.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("not connected to broker")]
    NotConnected,

    #[error("broker connection lost")]
    ConnectionLost,

    /// The broker negatively acknowledged a publish.
    #[error("publish of {event_type} v{version} for {aggregate_id} was not confirmed")]
    PublishUnconfirmed {
        aggregate_id: String,
        event_type: String,
        version: i32,
    },

    #[error("no publisher confirm within {0:?}")]
    PublishTimeout(std::time::Duration),

    /// A mandatory publish matched no queue.
    #[error("message returned unroutable by exchange {exchange}")]
    Unroutable { exchange: String },

    #[error("failed to encode event message: {0}")]
    Encode(String),
}

/// Errors handling a single delivery. All of them go through the
/// retry/dead-letter policy.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown event type: {0}")]
    UnknownEventType(String),

    #[error("invalid payload for {event_type}: {reason}")]
    InvalidPayload { event_type: String, reason: String },

    #[error("projection failed: {0}")]
    Projection(#[from] ProjectionError),

    #[error("processing exceeded {0:?}")]
    Timeout(std::time::Duration),
}

impl From<EventError> for ProcessingError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::UnknownEventType(event_type) => ProcessingError::UnknownEventType(event_type),
            EventError::InvalidPayload { event_type, reason } => {
                ProcessingError::InvalidPayload { event_type, reason }
            }
            other => ProcessingError::Malformed(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        ProcessingError::Malformed(err.to_string())
    }
}
