//! Event envelope - the common wrapper for all events.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::EventError;

/// Aggregate type for event routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    #[default]
    User,
}

impl AggregateType {
    /// Parses the stored/wire form.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        match s {
            "user" => Ok(AggregateType::User),
            other => Err(EventError::UnknownAggregateType(other.to_string())),
        }
    }

    /// Broker routing key for events of this aggregate type.
    pub fn routing_key(&self) -> &'static str {
        match self {
            AggregateType::User => "user.events",
        }
    }
}

impl std::fmt::Display for AggregateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AggregateType::User => "user",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for AggregateType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A concrete payload struct for one event type.
pub trait EventPayload: Serialize + DeserializeOwned {
    /// The event type string this payload is stored and routed under.
    const EVENT_TYPE: &'static str;
}

/// The closed set of events an aggregate produces.
pub trait DomainEvent: Clone + Send + Sync + 'static {
    /// Event type string of the active variant.
    fn event_type(&self) -> &'static str;

    /// Encodes the active variant's payload.
    fn encode_payload(&self) -> Result<Vec<u8>, EventError>;
}

/// A typed event together with its envelope metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EventEnvelope<E> {
    /// The ID of the aggregate instance.
    pub aggregate_id: String,

    /// The type of aggregate this event belongs to.
    pub aggregate_type: AggregateType,

    /// Monotonic version within the aggregate, starting at 1.
    pub version: i32,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Event-specific payload.
    pub payload: E,
}

impl<E: DomainEvent> EventEnvelope<E> {
    /// The event type (e.g., "user.registered").
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }

    /// Encodes the payload, producing the persisted/wire form.
    pub fn to_raw(&self) -> Result<RawEvent, EventError> {
        Ok(RawEvent {
            aggregate_id: self.aggregate_id.clone(),
            aggregate_type: self.aggregate_type,
            event_type: self.event_type().to_string(),
            version: self.version,
            occurred_at: self.occurred_at,
            payload: self.payload.encode_payload()?,
        })
    }
}

/// An event whose payload is still encoded (JSON bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub aggregate_id: String,
    pub aggregate_type: AggregateType,
    pub event_type: String,
    pub version: i32,
    pub occurred_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}
