//! Event registry: event type string to payload decoder.
//!
//! The registry is an explicit value built at startup and shared by reference
//! with whatever needs to decode events (store readers, the broker consumer).
//! Registration goes through [`EventPayload`], so a decoder can only be bound
//! to the type string its payload declares.

use std::collections::HashMap;

use crate::{DomainEvent, EventEnvelope, EventError, EventPayload, RawEvent};

type Decoder<E> = fn(&str, &[u8]) -> Result<E, EventError>;

/// Maps event type strings to decoders producing `E`.
pub struct EventRegistry<E> {
    decoders: HashMap<&'static str, Decoder<E>>,
}

impl<E: DomainEvent> EventRegistry<E> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Register the payload type `P` under `P::EVENT_TYPE`.
    pub fn register<P>(&mut self) -> &mut Self
    where
        P: EventPayload + Into<E>,
    {
        self.decoders.insert(P::EVENT_TYPE, decode_as::<P, E>);
        self
    }

    /// Whether a decoder is registered for `event_type`.
    pub fn contains(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// All registered event types.
    pub fn event_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.decoders.keys().copied()
    }

    /// Decode a payload registered under `event_type`.
    ///
    /// # Errors
    ///
    /// `UnknownEventType` when nothing is registered for the type,
    /// `InvalidPayload` when the bytes do not match the registered payload.
    pub fn create(&self, event_type: &str, payload: &[u8]) -> Result<E, EventError> {
        let decode = self
            .decoders
            .get(event_type)
            .ok_or_else(|| EventError::UnknownEventType(event_type.to_string()))?;
        decode(event_type, payload)
    }

    /// Decode a raw event into its typed envelope.
    pub fn decode(&self, raw: &RawEvent) -> Result<EventEnvelope<E>, EventError> {
        let payload = self.create(&raw.event_type, &raw.payload)?;
        Ok(EventEnvelope {
            aggregate_id: raw.aggregate_id.clone(),
            aggregate_type: raw.aggregate_type,
            version: raw.version,
            occurred_at: raw.occurred_at,
            payload,
        })
    }

    /// Decode a batch, failing on the first undecodable event.
    pub fn decode_all<'a>(
        &self,
        raws: impl IntoIterator<Item = &'a RawEvent>,
    ) -> Result<Vec<EventEnvelope<E>>, EventError> {
        raws.into_iter().map(|raw| self.decode(raw)).collect()
    }
}

impl<E: DomainEvent> Default for EventRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for EventRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.decoders.keys().collect();
        types.sort();
        f.debug_struct("EventRegistry")
            .field("event_types", &types)
            .finish()
    }
}

fn decode_as<P, E>(event_type: &str, payload: &[u8]) -> Result<E, EventError>
where
    P: EventPayload + Into<E>,
{
    serde_json::from_slice::<P>(payload)
        .map(Into::into)
        .map_err(|e| EventError::InvalidPayload {
            event_type: event_type.to_string(),
            reason: e.to_string(),
        })
}
