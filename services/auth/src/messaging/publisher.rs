//! Publisher contract.

use async_trait::async_trait;
use dcart_events::RawEvent;

use super::BrokerError;

/// Relays committed events to the broker.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event and wait for the broker to confirm it.
    ///
    /// Must only be called once the event is durably stored.
    async fn publish(&self, event: &RawEvent) -> Result<(), BrokerError>;
}
