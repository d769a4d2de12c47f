//! Wire form of an event.

use chrono::{DateTime, Utc};
use dcart_events::{AggregateType, RawEvent};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::{BrokerError, ProcessingError, CONTENT_TYPE};

/// JSON message body carried by the broker.
///
/// The payload is embedded verbatim; it is only interpreted once the
/// registry has resolved `event_type`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub aggregate_id: String,
    pub aggregate_type: AggregateType,
    pub event_type: String,
    pub version: i32,
    pub timestamp: DateTime<Utc>,
    pub payload: Box<RawValue>,
}

impl EventMessage {
    /// Build the message body for a stored event.
    pub fn encode(event: &RawEvent) -> Result<Vec<u8>, BrokerError> {
        let payload = std::str::from_utf8(&event.payload)
            .map_err(|e| BrokerError::Encode(e.to_string()))?;
        let payload = RawValue::from_string(payload.to_string())
            .map_err(|e| BrokerError::Encode(e.to_string()))?;

        let message = EventMessage {
            aggregate_id: event.aggregate_id.clone(),
            aggregate_type: event.aggregate_type,
            event_type: event.event_type.clone(),
            version: event.version,
            timestamp: event.occurred_at,
            payload,
        };

        serde_json::to_vec(&message).map_err(|e| BrokerError::Encode(e.to_string()))
    }

    /// Parse a delivery body. Anything not declared as [`CONTENT_TYPE`] is
    /// rejected.
    pub fn decode(content_type: Option<&str>, body: &[u8]) -> Result<RawEvent, ProcessingError> {
        match content_type {
            Some(CONTENT_TYPE) => {}
            Some(other) => {
                return Err(ProcessingError::Malformed(format!(
                    "unsupported content type {other}"
                )))
            }
            None => {
                return Err(ProcessingError::Malformed(
                    "missing content type".to_string(),
                ))
            }
        }

        let message: EventMessage = serde_json::from_slice(body)?;
        if message.version < 1 {
            return Err(ProcessingError::Malformed(format!(
                "invalid version {}",
                message.version
            )));
        }

        Ok(RawEvent {
            aggregate_id: message.aggregate_id,
            aggregate_type: message.aggregate_type,
            event_type: message.event_type,
            version: message.version,
            occurred_at: message.timestamp,
            payload: message.payload.get().as_bytes().to_vec(),
        })
    }
}
