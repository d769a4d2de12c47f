//! In-process broker.
//!
//! Models one work queue with its dead-letter queue, the `x-retry-count`
//! header, redelivery of unsettled messages and forced connection loss. It is
//! both an [`EventPublisher`] and a consumer [`Transport`].

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use dcart_events::RawEvent;
use tokio::sync::{Mutex, Notify};
use tracing::debug;

use super::{
    BrokerConfig, BrokerError, Delivery, EventMessage, EventPublisher, InboundMessage, Session,
    Settlement, Transport, CONTENT_TYPE,
};

#[derive(Debug, Default)]
struct BrokerState {
    queue: VecDeque<InboundMessage>,
    dead_letters: Vec<InboundMessage>,
    /// `x-retry-count` of every delivery handed out, in order.
    delivery_log: Vec<u32>,
    acked: usize,
    /// Bumped by `disconnect_all`; sessions from an older generation are dead.
    generation: u64,
    connect_attempts: usize,
    connections: usize,
    refuse_connections: bool,
    reject_publishes: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    changed: Notify,
}

/// In-memory broker; clones share the same queues.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a raw message as-is.
    pub async fn inject(&self, body: Vec<u8>, content_type: Option<&str>) {
        let mut state = self.shared.state.lock().await;
        state.queue.push_back(InboundMessage {
            content_type: content_type.map(str::to_string),
            retry_count: 0,
            body,
        });
        drop(state);
        self.shared.changed.notify_waiters();
    }

    /// Drop every open session; unsettled messages go back to the queue.
    pub async fn disconnect_all(&self) {
        let mut state = self.shared.state.lock().await;
        state.generation += 1;
        drop(state);
        self.shared.changed.notify_waiters();
    }

    /// Make subsequent connection attempts fail.
    pub async fn set_refuse_connections(&self, refuse: bool) {
        self.shared.state.lock().await.refuse_connections = refuse;
    }

    /// Make subsequent publishes come back unconfirmed.
    pub async fn set_reject_publishes(&self, reject: bool) {
        self.shared.state.lock().await.reject_publishes = reject;
    }

    pub async fn queue_len(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }

    pub async fn dead_letters(&self) -> Vec<InboundMessage> {
        self.shared.state.lock().await.dead_letters.clone()
    }

    pub async fn delivery_log(&self) -> Vec<u32> {
        self.shared.state.lock().await.delivery_log.clone()
    }

    pub async fn acked(&self) -> usize {
        self.shared.state.lock().await.acked
    }

    pub async fn connect_attempts(&self) -> usize {
        self.shared.state.lock().await.connect_attempts
    }

    /// Successful connections so far; each one declared the topology.
    pub async fn connections(&self) -> usize {
        self.shared.state.lock().await.connections
    }
}

#[async_trait]
impl EventPublisher for MemoryBroker {
    async fn publish(&self, event: &RawEvent) -> Result<(), BrokerError> {
        let body = EventMessage::encode(event)?;

        let mut state = self.shared.state.lock().await;
        if state.reject_publishes {
            return Err(BrokerError::PublishUnconfirmed {
                aggregate_id: event.aggregate_id.clone(),
                event_type: event.event_type.clone(),
                version: event.version,
            });
        }
        state.queue.push_back(InboundMessage {
            content_type: Some(CONTENT_TYPE.to_string()),
            retry_count: 0,
            body,
        });
        drop(state);

        self.shared.changed.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    type Session = MemorySession;

    async fn connect(&self, _config: &BrokerConfig) -> Result<MemorySession, BrokerError> {
        let mut state = self.shared.state.lock().await;
        state.connect_attempts += 1;
        if state.refuse_connections {
            return Err(BrokerError::NotConnected);
        }
        state.connections += 1;

        Ok(MemorySession {
            broker: self.clone(),
            generation: state.generation,
            consuming: false,
        })
    }
}

/// A session against a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemorySession {
    broker: MemoryBroker,
    generation: u64,
    consuming: bool,
}

#[async_trait]
impl Session for MemorySession {
    type Receipt = InboundMessage;

    async fn consume(&mut self) -> Result<(), BrokerError> {
        let state = self.broker.shared.state.lock().await;
        if state.generation != self.generation {
            return Err(BrokerError::ConnectionLost);
        }
        self.consuming = true;
        Ok(())
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery<InboundMessage>, BrokerError>> {
        if !self.consuming {
            return Some(Err(BrokerError::NotConnected));
        }

        let shared = &self.broker.shared;
        loop {
            let changed = shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            {
                let mut state = shared.state.lock().await;
                if state.generation != self.generation {
                    return None;
                }
                if let Some(message) = state.queue.pop_front() {
                    state.delivery_log.push(message.retry_count);
                    return Some(Ok(Delivery {
                        receipt: message.clone(),
                        message,
                    }));
                }
            }

            changed.await;
        }
    }

    async fn settle(
        &mut self,
        delivery: Delivery<InboundMessage>,
        settlement: Settlement,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.shared.state.lock().await;
        let mut message = delivery.receipt;

        if state.generation != self.generation {
            // The broker already reclaimed the delivery.
            state.queue.push_front(message);
            drop(state);
            self.broker.shared.changed.notify_waiters();
            return Err(BrokerError::ConnectionLost);
        }

        match settlement {
            Settlement::Ack => state.acked += 1,
            Settlement::Requeue { retry_count } => {
                message.retry_count = retry_count;
                state.queue.push_back(message);
            }
            Settlement::DeadLetter => state.dead_letters.push(message),
        }
        drop(state);

        debug!(?settlement, "Settled delivery");
        self.broker.shared.changed.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) {
        self.consuming = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dcart_events::AggregateType;
    use std::time::Duration;

    fn raw() -> RawEvent {
        RawEvent {
            aggregate_id: "agg-1".to_string(),
            aggregate_type: AggregateType::User,
            event_type: "user.registered".to_string(),
            version: 1,
            occurred_at: Utc::now(),
            payload: br#"{"username":"alice","password_hash":"h1"}"#.to_vec(),
        }
    }

    async fn session(broker: &MemoryBroker) -> MemorySession {
        let mut session = broker.connect(&BrokerConfig::default()).await.unwrap();
        session.consume().await.unwrap();
        session
    }

    #[tokio::test]
    async fn test_requeue_sets_retry_count() {
        let broker = MemoryBroker::new();
        broker.publish(&raw()).await.unwrap();
        let mut session = session(&broker).await;

        let delivery = session.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.message.retry_count, 0);
        session
            .settle(delivery, Settlement::Requeue { retry_count: 1 })
            .await
            .unwrap();

        let delivery = session.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.message.retry_count, 1);
        session.settle(delivery, Settlement::DeadLetter).await.unwrap();

        assert_eq!(broker.delivery_log().await, vec![0, 1]);
        assert_eq!(broker.dead_letters().await.len(), 1);
        assert_eq!(broker.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_waiting_session_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let mut session = session(&broker).await;

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(&raw()).await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), session.next_delivery())
            .await
            .unwrap();
        assert!(matches!(delivery, Some(Ok(_))));
    }

    #[tokio::test]
    async fn test_disconnect_returns_unsettled_delivery() {
        let broker = MemoryBroker::new();
        broker.publish(&raw()).await.unwrap();
        let mut session = session(&broker).await;

        let delivery = session.next_delivery().await.unwrap().unwrap();
        broker.disconnect_all().await;

        let err = session.settle(delivery, Settlement::Ack).await.unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionLost));
        assert!(session.next_delivery().await.is_none());
        assert_eq!(broker.queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let broker = MemoryBroker::new();
        broker.set_refuse_connections(true).await;

        let result = broker.connect(&BrokerConfig::default()).await;
        assert!(matches!(result, Err(BrokerError::NotConnected)));
        assert_eq!(broker.connect_attempts().await, 1);
        assert_eq!(broker.connections().await, 0);
    }
}
