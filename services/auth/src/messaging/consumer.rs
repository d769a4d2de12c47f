//! Event consumer.
//!
//! One control task drives the consumer through its states:
//!
//! ```text
//! Disconnected -> Connecting -> Ready -> Consuming -> (Disconnected | ShuttingDown) -> Stopped
//! ```
//!
//! Connecting declares the full topology, so every reconnect re-declares it.
//! Reconnecting and consuming are phases of the same loop, so a consumer
//! never holds more than one session. Waits (connect, backoff, next delivery)
//! race the shutdown signal; processing a delivery does not, but is bounded by
//! the processing timeout.

use std::sync::Arc;

use async_trait::async_trait;
use dcart_events::{EventRegistry, UserEvent};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::projections::{ProjectionOutcome, Projector};

use super::{BrokerConfig, BrokerError, EventMessage, ProcessingError, MAX_RETRIES};

/// Lifecycle state of an [`EventConsumer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    /// Topology declared, subscription not yet open.
    Ready,
    Consuming,
    ShuttingDown,
    Stopped,
}

/// A delivery as seen by the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub content_type: Option<String>,
    /// Value of the `x-retry-count` header, 0 when absent.
    pub retry_count: u32,
    pub body: Vec<u8>,
}

/// A delivery plus whatever the transport needs to settle it.
#[derive(Debug)]
pub struct Delivery<R> {
    pub message: InboundMessage,
    pub receipt: R,
}

/// How a delivery is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; remove it from the queue.
    Ack,
    /// Redeliver with the given `x-retry-count`.
    Requeue { retry_count: u32 },
    /// Reject without requeue; the broker routes it to the dead-letter queue.
    DeadLetter,
}

/// Settlement for a failed delivery that carried `retry_count`.
pub fn settle_failure(retry_count: u32) -> Settlement {
    if retry_count < MAX_RETRIES {
        Settlement::Requeue {
            retry_count: retry_count + 1,
        }
    } else {
        Settlement::DeadLetter
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Session: Session;

    /// Connect and declare the consumer topology.
    async fn connect(&self, config: &BrokerConfig) -> Result<Self::Session, BrokerError>;
}

/// A live connection with its topology declared.
#[async_trait]
pub trait Session: Send + 'static {
    type Receipt: Send;

    /// Open the subscription on the work queue.
    async fn consume(&mut self) -> Result<(), BrokerError>;

    /// Next delivery. `None` means the delivery stream closed.
    async fn next_delivery(&mut self) -> Option<Result<Delivery<Self::Receipt>, BrokerError>>;

    async fn settle(
        &mut self,
        delivery: Delivery<Self::Receipt>,
        settlement: Settlement,
    ) -> Result<(), BrokerError>;

    /// Close channel and connection. Errors are swallowed.
    async fn close(&mut self);
}

/// Control surface of a running consumer.
#[derive(Debug, Clone)]
pub struct ConsumerHandle {
    shutdown: Arc<watch::Sender<bool>>,
    state: watch::Receiver<ConsumerState>,
}

impl ConsumerHandle {
    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Wait until the consumer reaches `target`. Returns false if the
    /// consumer went away first.
    pub async fn wait_for(&self, target: ConsumerState) -> bool {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| *s == target).await.is_ok();
        reached
    }

    /// Wait until the consumer has stopped.
    pub async fn wait_stopped(&self) {
        let mut state = self.state.clone();
        // A closed channel means the control task is gone as well.
        let _ = state.wait_for(|s| *s == ConsumerState::Stopped).await;
    }
}

enum SessionEnd {
    Shutdown,
    Lost(BrokerError),
}

/// Consumes events from the broker and feeds them to a projector.
pub struct EventConsumer<T: Transport> {
    transport: T,
    config: BrokerConfig,
    registry: Arc<EventRegistry<UserEvent>>,
    projector: Arc<dyn Projector>,
    state: watch::Sender<ConsumerState>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
}

impl<T: Transport> EventConsumer<T> {
    pub fn new(
        transport: T,
        config: BrokerConfig,
        registry: Arc<EventRegistry<UserEvent>>,
        projector: Arc<dyn Projector>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        let (shutdown_tx, shutdown) = watch::channel(false);

        Self {
            transport,
            config,
            registry,
            projector,
            state,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown,
        }
    }

    pub fn handle(&self) -> ConsumerHandle {
        ConsumerHandle {
            shutdown: self.shutdown_tx.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Spawn the control loop onto the runtime.
    pub fn start(self) -> ConsumerHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// Run the control loop until shutdown is requested.
    #[instrument(skip(self), name = "event_consumer", fields(queue = %self.config.queue, projection = self.projector.name()))]
    pub async fn run(mut self) {
        info!("Starting event consumer");

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            self.set_state(ConsumerState::Connecting);
            let connected = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break,
                result = self.transport.connect(&self.config) => result,
            };

            let mut session = match connected {
                Ok(session) => session,
                Err(e) => {
                    warn!(
                        error = %e,
                        delay_ms = self.config.reconnect_delay.as_millis() as u64,
                        "Failed to connect to broker, retrying"
                    );
                    self.set_state(ConsumerState::Disconnected);
                    if !self.backoff().await {
                        break;
                    }
                    continue;
                }
            };
            self.set_state(ConsumerState::Ready);

            if let Err(e) = session.consume().await {
                warn!(error = %e, "Failed to open subscription, retrying");
                session.close().await;
                self.set_state(ConsumerState::Disconnected);
                if !self.backoff().await {
                    break;
                }
                continue;
            }
            self.set_state(ConsumerState::Consuming);
            info!("Consuming events");

            match self.consume(&mut session).await {
                SessionEnd::Shutdown => {
                    self.set_state(ConsumerState::ShuttingDown);
                    session.close().await;
                    break;
                }
                SessionEnd::Lost(e) => {
                    warn!(error = %e, "Broker connection lost, reconnecting");
                    session.close().await;
                    self.set_state(ConsumerState::Disconnected);
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        self.set_state(ConsumerState::ShuttingDown);
        self.set_state(ConsumerState::Stopped);
        info!("Event consumer stopped");
    }

    /// Deliver until the session ends.
    async fn consume(&mut self, session: &mut T::Session) -> SessionEnd {
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return SessionEnd::Shutdown,
                next = session.next_delivery() => next,
            };

            let delivery = match next {
                None => return SessionEnd::Lost(BrokerError::ConnectionLost),
                Some(Err(e)) => return SessionEnd::Lost(e),
                Some(Ok(delivery)) => delivery,
            };

            let settlement = self.handle_delivery(&delivery.message).await;
            if let Err(e) = session.settle(delivery, settlement).await {
                return SessionEnd::Lost(e);
            }
        }
    }

    async fn handle_delivery(&self, message: &InboundMessage) -> Settlement {
        match self.process(message).await {
            Ok(outcome) => {
                debug!(?outcome, "Delivery processed");
                Settlement::Ack
            }
            Err(e) => {
                let settlement = settle_failure(message.retry_count);
                match settlement {
                    Settlement::Requeue { retry_count } => {
                        warn!(error = %e, retry_count, "Delivery failed, requeueing");
                    }
                    _ => {
                        error!(
                            error = %e,
                            retry_count = message.retry_count,
                            "Delivery failed after retries, dead-lettering"
                        );
                    }
                }
                settlement
            }
        }
    }

    /// Decode, resolve through the registry, project under the deadline.
    #[instrument(skip_all, fields(retry_count = message.retry_count))]
    async fn process(&self, message: &InboundMessage) -> Result<ProjectionOutcome, ProcessingError> {
        let raw = EventMessage::decode(message.content_type.as_deref(), &message.body)?;
        let event = self.registry.decode(&raw)?;

        let deadline = self.config.processing_timeout;
        let outcome = tokio::time::timeout(deadline, self.projector.project(&event))
            .await
            .map_err(|_| ProcessingError::Timeout(deadline))??;
        Ok(outcome)
    }

    /// Sleep for the reconnect delay. Returns false if shutdown arrived first.
    async fn backoff(&mut self) -> bool {
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown) => false,
            _ = sleep(self.config.reconnect_delay) => true,
        }
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, current = ?state, "Consumer state changed");
        }
    }
}

/// Resolves once shutdown has been requested.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // The consumer keeps its own sender alive, so the channel cannot close.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
