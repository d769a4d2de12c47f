//! AMQP 0-9-1 adapter (RabbitMQ) built on lapin.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use dcart_events::RawEvent;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use super::{
    BrokerConfig, BrokerError, Delivery, EventMessage, EventPublisher, InboundMessage, Session,
    Settlement, Transport, CONTENT_TYPE, HEADER_AGGREGATE_ID, HEADER_AGGREGATE_TYPE,
    HEADER_EVENT_TYPE, HEADER_RETRY_COUNT, HEADER_VERSION,
};

const CONSUMER_TAG: &str = "auth-projector";
const PERSISTENT: u8 = 2;
const REPLY_SUCCESS: u16 = 200;

struct AmqpLink {
    connection: Connection,
    channel: Channel,
}

impl AmqpLink {
    /// Connect and open a channel in confirm mode.
    async fn open(uri: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(uri, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(Self {
            connection,
            channel,
        })
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) {
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "shutdown").await {
            debug!(error = %e, "Channel close failed");
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "shutdown").await {
            debug!(error = %e, "Connection close failed");
        }
    }
}

async fn declare_exchange(channel: &Channel, config: &BrokerConfig) -> Result<(), BrokerError> {
    channel
        .exchange_declare(
            &config.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    Ok(())
}

/// Declare exchange, dead-letter exchange, both queues and their bindings,
/// then apply the prefetch limit.
async fn declare_topology(channel: &Channel, config: &BrokerConfig) -> Result<(), BrokerError> {
    let dlx = config.dead_letter_exchange();
    let dlq = config.dead_letter_queue();

    declare_exchange(channel, config).await?;
    channel
        .exchange_declare(
            &dlx,
            ExchangeKind::Fanout,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let mut queue_args = FieldTable::default();
    queue_args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString(dlx.clone().into()),
    );
    queue_args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(i64::try_from(config.message_ttl.as_millis()).unwrap_or(i64::MAX)),
    );
    channel
        .queue_declare(
            &config.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            queue_args,
        )
        .await?;
    channel
        .queue_declare(
            &dlq,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    channel
        .queue_bind(
            &config.queue,
            &config.exchange,
            &config.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;
    channel
        .queue_bind(
            &dlq,
            &dlx,
            &config.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await?;

    channel
        .basic_qos(config.prefetch, BasicQosOptions::default())
        .await?;

    info!(
        exchange = %config.exchange,
        queue = %config.queue,
        dead_letter_queue = %dlq,
        prefetch = config.prefetch,
        "Declared broker topology"
    );
    Ok(())
}

fn event_properties(event: &RawEvent) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        HEADER_AGGREGATE_ID.into(),
        AMQPValue::LongString(event.aggregate_id.clone().into()),
    );
    headers.insert(
        HEADER_AGGREGATE_TYPE.into(),
        AMQPValue::LongString(event.aggregate_type.to_string().into()),
    );
    headers.insert(
        HEADER_EVENT_TYPE.into(),
        AMQPValue::LongString(event.event_type.clone().into()),
    );
    headers.insert(HEADER_VERSION.into(), AMQPValue::LongInt(event.version));

    BasicProperties::default()
        .with_content_type(CONTENT_TYPE.into())
        .with_delivery_mode(PERSISTENT)
        .with_timestamp(u64::try_from(event.occurred_at.timestamp()).unwrap_or_default())
        .with_headers(headers)
}

fn header<'a>(table: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

/// Reads `x-retry-count`, accepting any integer width a client may have used.
fn retry_count(properties: &BasicProperties) -> u32 {
    let value = properties
        .headers()
        .as_ref()
        .and_then(|headers| header(headers, HEADER_RETRY_COUNT));

    match value {
        Some(AMQPValue::ShortShortInt(v)) => u32::try_from(*v).unwrap_or(0),
        Some(AMQPValue::ShortShortUInt(v)) => u32::from(*v),
        Some(AMQPValue::ShortInt(v)) => u32::try_from(*v).unwrap_or(0),
        Some(AMQPValue::ShortUInt(v)) => u32::from(*v),
        Some(AMQPValue::LongInt(v)) => u32::try_from(*v).unwrap_or(0),
        Some(AMQPValue::LongUInt(v)) => *v,
        Some(AMQPValue::LongLongInt(v)) => u32::try_from(*v).unwrap_or(0),
        _ => 0,
    }
}

/// Wait at most `deadline` for the broker to confirm a publish.
async fn await_confirm<F>(confirm: F, deadline: Duration) -> Result<Confirmation, BrokerError>
where
    F: Future<Output = Result<Confirmation, lapin::Error>>,
{
    tokio::time::timeout(deadline, confirm)
        .await
        .map_err(|_| BrokerError::PublishTimeout(deadline))?
        .map_err(BrokerError::from)
}

/// Publishes events with publisher confirms.
///
/// Holds one connection and channel. The read-write lock keeps publishes
/// (readers) from observing a link that `reconnect` is replacing.
pub struct AmqpPublisher {
    config: BrokerConfig,
    link: RwLock<Option<AmqpLink>>,
}

impl AmqpPublisher {
    /// Connect and declare the exchange.
    pub async fn connect(config: BrokerConfig) -> Result<Self, BrokerError> {
        let publisher = Self {
            config,
            link: RwLock::new(None),
        };
        publisher.reconnect().await?;
        Ok(publisher)
    }

    /// Replace the current link with a fresh one.
    #[instrument(skip(self), fields(exchange = %self.config.exchange))]
    pub async fn reconnect(&self) -> Result<(), BrokerError> {
        let mut link = self.link.write().await;
        if let Some(old) = link.take() {
            old.close().await;
        }

        let fresh = AmqpLink::open(&self.config.uri).await?;
        declare_exchange(&fresh.channel, &self.config).await?;
        *link = Some(fresh);

        info!("Publisher connected");
        Ok(())
    }

    pub async fn is_connected(&self) -> bool {
        self.link
            .read()
            .await
            .as_ref()
            .is_some_and(AmqpLink::is_connected)
    }

    pub async fn close(&self) {
        if let Some(link) = self.link.write().await.take() {
            link.close().await;
        }
    }
}

#[async_trait]
impl EventPublisher for AmqpPublisher {
    #[instrument(
        skip(self, event),
        fields(aggregate_id = %event.aggregate_id, event_type = %event.event_type, version = event.version)
    )]
    async fn publish(&self, event: &RawEvent) -> Result<(), BrokerError> {
        if !self.is_connected().await {
            warn!("Publisher link down, reconnecting");
            self.reconnect().await?;
        }

        let body = EventMessage::encode(event)?;
        let confirm = {
            let link = self.link.read().await;
            let link = link.as_ref().ok_or(BrokerError::NotConnected)?;
            link.channel
                .basic_publish(
                    &self.config.exchange,
                    &self.config.routing_key,
                    BasicPublishOptions {
                        mandatory: true,
                        ..Default::default()
                    },
                    &body,
                    event_properties(event),
                )
                .await?
        };

        match await_confirm(confirm, self.config.confirm_timeout).await? {
            Confirmation::Ack(None) => {
                debug!("Publish confirmed");
                Ok(())
            }
            Confirmation::Ack(Some(_)) => Err(BrokerError::Unroutable {
                exchange: self.config.exchange.clone(),
            }),
            Confirmation::Nack(_) | Confirmation::NotRequested => {
                Err(BrokerError::PublishUnconfirmed {
                    aggregate_id: event.aggregate_id.clone(),
                    event_type: event.event_type.clone(),
                    version: event.version,
                })
            }
        }
    }
}

/// Opens consumer sessions against RabbitMQ.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpTransport;

#[async_trait]
impl Transport for AmqpTransport {
    type Session = AmqpSession;

    async fn connect(&self, config: &BrokerConfig) -> Result<AmqpSession, BrokerError> {
        let link = AmqpLink::open(&config.uri).await?;
        if let Err(e) = declare_topology(&link.channel, config).await {
            link.close().await;
            return Err(e);
        }

        Ok(AmqpSession {
            link,
            queue: config.queue.clone(),
            confirm_timeout: config.confirm_timeout,
            consumer: None,
        })
    }
}

/// A consumer connection with its topology declared.
pub struct AmqpSession {
    link: AmqpLink,
    queue: String,
    confirm_timeout: Duration,
    consumer: Option<lapin::Consumer>,
}

impl AmqpSession {
    /// Put the message back on the work queue with a new retry count, then
    /// ack the original. If the copy is not confirmed within the confirm
    /// timeout the original is requeued unchanged.
    async fn requeue(
        &self,
        delivery: lapin::message::Delivery,
        retry_count: u32,
    ) -> Result<(), BrokerError> {
        let mut headers = delivery.properties.headers().clone().unwrap_or_default();
        headers.insert(
            HEADER_RETRY_COUNT.into(),
            AMQPValue::LongInt(i32::try_from(retry_count).unwrap_or(i32::MAX)),
        );
        let properties = delivery.properties.clone().with_headers(headers);

        let confirm = self
            .link
            .channel
            .basic_publish(
                "",
                &self.queue,
                BasicPublishOptions::default(),
                &delivery.data,
                properties,
            )
            .await?;

        let confirmed = match await_confirm(confirm, self.confirm_timeout).await {
            Ok(confirmation) => matches!(confirmation, Confirmation::Ack(None)),
            Err(BrokerError::PublishTimeout(deadline)) => {
                warn!(?deadline, "Retry copy confirm timed out");
                false
            }
            Err(e) => return Err(e),
        };

        if confirmed {
            delivery.acker.ack(BasicAckOptions::default()).await?;
        } else {
            warn!("Retry copy not confirmed, requeueing original");
            delivery
                .acker
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Session for AmqpSession {
    type Receipt = lapin::message::Delivery;

    async fn consume(&mut self) -> Result<(), BrokerError> {
        let consumer = self
            .link
            .channel
            .basic_consume(
                &self.queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn next_delivery(
        &mut self,
    ) -> Option<Result<Delivery<lapin::message::Delivery>, BrokerError>> {
        let Some(consumer) = self.consumer.as_mut() else {
            return Some(Err(BrokerError::NotConnected));
        };

        match consumer.next().await? {
            Ok(delivery) => {
                let message = InboundMessage {
                    content_type: delivery
                        .properties
                        .content_type()
                        .as_ref()
                        .map(|ct| ct.as_str().to_string()),
                    retry_count: retry_count(&delivery.properties),
                    body: delivery.data.clone(),
                };
                Some(Ok(Delivery {
                    message,
                    receipt: delivery,
                }))
            }
            Err(e) => Some(Err(e.into())),
        }
    }

    async fn settle(
        &mut self,
        delivery: Delivery<lapin::message::Delivery>,
        settlement: Settlement,
    ) -> Result<(), BrokerError> {
        let receipt = delivery.receipt;
        match settlement {
            Settlement::Ack => receipt.acker.ack(BasicAckOptions::default()).await?,
            Settlement::Requeue { retry_count } => self.requeue(receipt, retry_count).await?,
            Settlement::DeadLetter => {
                receipt
                    .acker
                    .nack(BasicNackOptions {
                        requeue: false,
                        ..Default::default()
                    })
                    .await?
            }
        }
        Ok(())
    }

    async fn close(&mut self) {
        self.consumer = None;
        self.link.close().await;
    }
}
