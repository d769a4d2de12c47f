//! End-to-end pipeline over the in-memory store, broker and read model:
//! command -> append -> publish -> consume -> project.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dcart_auth::{
    commands::UserCommandHandler,
    db::{EventStore, MemoryEventStore, MemoryUserViews, UserViewStore},
    messaging::{
        BrokerConfig, ConsumerHandle, ConsumerState, EventConsumer, EventMessage, EventPublisher,
        MemoryBroker, CONTENT_TYPE,
    },
    projections::{ProjectionOutcome, ProjectionResult, Projector, UsersProjection},
    security::{CredentialHasher, HashError},
};
use dcart_events::{
    register_events, AggregateRoot, AggregateType, EventEnvelope, EventRegistry,
    PasswordChanged, RawEvent, UserEvent, UserRegistered,
};

struct PrefixHasher;

impl CredentialHasher for PrefixHasher {
    fn hash(&self, password: &str) -> Result<String, HashError> {
        Ok(format!("hashed:{password}"))
    }

    fn compare(&self, hash: &str, password: &str) -> bool {
        hash.strip_prefix("hashed:") == Some(password)
    }
}

struct Pipeline {
    commands: UserCommandHandler,
    store: Arc<MemoryEventStore>,
    views: Arc<MemoryUserViews>,
    broker: MemoryBroker,
    consumer: ConsumerHandle,
}

fn registry() -> Arc<EventRegistry<UserEvent>> {
    let mut registry = EventRegistry::new();
    register_events(&mut registry);
    Arc::new(registry)
}

fn broker_config() -> BrokerConfig {
    BrokerConfig {
        reconnect_delay: Duration::from_millis(50),
        processing_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

fn start_pipeline(config: BrokerConfig) -> Pipeline {
    let store = Arc::new(MemoryEventStore::new());
    let views = Arc::new(MemoryUserViews::new());
    let broker = MemoryBroker::new();
    let registry = registry();

    let commands = UserCommandHandler::new(
        store.clone(),
        registry.clone(),
        Arc::new(broker.clone()),
        Arc::new(PrefixHasher),
        "itest",
    );

    let consumer = EventConsumer::new(
        broker.clone(),
        config,
        registry,
        Arc::new(UsersProjection::new(views.clone())),
    )
    .start();

    Pipeline {
        commands,
        store,
        views,
        broker,
        consumer,
    }
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check().await {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn raw_event(aggregate_id: &str, version: i32, payload: UserEvent) -> RawEvent {
    EventEnvelope {
        aggregate_id: aggregate_id.to_string(),
        aggregate_type: AggregateType::User,
        version,
        occurred_at: Utc::now(),
        payload,
    }
    .to_raw()
    .unwrap()
}

#[tokio::test]
async fn registered_then_password_changed_reaches_read_model() {
    let pipeline = start_pipeline(broker_config());

    let receipt = pipeline
        .commands
        .register_user("alice", "correct-horse")
        .await
        .unwrap();
    assert!(receipt.unpublished.is_empty());

    let views = pipeline.views.clone();
    eventually("alice projected at v1", || {
        let views = views.clone();
        async move {
            matches!(views.find_by_username("alice").await, Ok(Some(row)) if row.version == 1)
        }
    })
    .await;

    let id = pipeline.commands.user_id("alice");
    pipeline
        .commands
        .change_password(&id, "correct-horse", "battery-staple")
        .await
        .unwrap();

    eventually("password change projected at v2", || {
        let views = views.clone();
        async move {
            matches!(views.find_by_username("alice").await, Ok(Some(row)) if row.version == 2)
        }
    })
    .await;

    let row = views.get(id.as_str()).await.unwrap().unwrap();
    assert_eq!(row.password_hash, "hashed:battery-staple");
    assert_eq!(row.user_id, id.as_str());

    // Source of truth agrees with the read model.
    let user = pipeline.commands.load(&id).await.unwrap();
    assert_eq!(user.version(), 2);
    assert_eq!(pipeline.store.get_events(id.as_str()).await.unwrap().len(), 2);
    assert_eq!(pipeline.broker.acked().await, 2);

    pipeline.consumer.stop();
    pipeline.consumer.wait_stopped().await;
}

#[tokio::test]
async fn unknown_event_type_is_retried_three_times_then_dead_lettered() {
    let pipeline = start_pipeline(broker_config());

    let mut event = raw_event(
        "agg-1",
        1,
        UserEvent::PasswordChanged(PasswordChanged {
            new_password_hash: "h".to_string(),
        }),
    );
    event.event_type = "user.deleted".to_string();
    pipeline
        .broker
        .inject(EventMessage::encode(&event).unwrap(), Some(CONTENT_TYPE))
        .await;

    let broker = pipeline.broker.clone();
    eventually("message dead-lettered", || {
        let broker = broker.clone();
        async move { !broker.dead_letters().await.is_empty() }
    })
    .await;

    assert_eq!(broker.delivery_log().await, vec![0, 1, 2, 3]);
    let dead = broker.dead_letters().await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 3);
    assert_eq!(broker.acked().await, 0);
    assert!(pipeline.views.is_empty().await);

    pipeline.consumer.stop();
    pipeline.consumer.wait_stopped().await;
}

/// Never finishes within any reasonable processing deadline.
struct StalledProjector;

#[async_trait]
impl Projector for StalledProjector {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn project(
        &self,
        _event: &EventEnvelope<UserEvent>,
    ) -> ProjectionResult<ProjectionOutcome> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(ProjectionOutcome::Applied)
    }
}

#[tokio::test]
async fn projection_past_deadline_counts_as_failed_attempt() {
    let broker = MemoryBroker::new();
    let config = BrokerConfig {
        processing_timeout: Duration::from_millis(20),
        ..broker_config()
    };
    let consumer = EventConsumer::new(
        broker.clone(),
        config,
        registry(),
        Arc::new(StalledProjector),
    )
    .start();

    broker
        .publish(&raw_event(
            "agg-1",
            1,
            UserEvent::Registered(UserRegistered {
                username: "alice".to_string(),
                password_hash: "h1".to_string(),
            }),
        ))
        .await
        .unwrap();

    let observed = broker.clone();
    eventually("stalled delivery dead-lettered", || {
        let broker = observed.clone();
        async move { broker.dead_letters().await.len() == 1 }
    })
    .await;

    assert_eq!(broker.delivery_log().await, vec![0, 1, 2, 3]);
    assert_eq!(broker.acked().await, 0);

    consumer.stop();
    tokio::time::timeout(Duration::from_secs(1), consumer.wait_stopped())
        .await
        .expect("consumer should stop after the stalled deliveries");
}

#[tokio::test]
async fn malformed_content_type_is_dead_lettered() {
    let pipeline = start_pipeline(broker_config());

    pipeline
        .broker
        .inject(b"<xml/>".to_vec(), Some("application/xml"))
        .await;

    let broker = pipeline.broker.clone();
    eventually("message dead-lettered", || {
        let broker = broker.clone();
        async move { broker.dead_letters().await.len() == 1 }
    })
    .await;
    assert_eq!(broker.delivery_log().await, vec![0, 1, 2, 3]);

    pipeline.consumer.stop();
    pipeline.consumer.wait_stopped().await;
}

#[tokio::test]
async fn redelivered_registration_leaves_row_unchanged() {
    let pipeline = start_pipeline(broker_config());
    let registered = raw_event(
        "agg-1",
        1,
        UserEvent::Registered(UserRegistered {
            username: "alice".to_string(),
            password_hash: "h1".to_string(),
        }),
    );

    pipeline.broker.publish(&registered).await.unwrap();
    let broker = pipeline.broker.clone();
    eventually("first delivery acked", || {
        let broker = broker.clone();
        async move { broker.acked().await == 1 }
    })
    .await;
    let first = pipeline.views.get("agg-1").await.unwrap().unwrap();

    pipeline.broker.publish(&registered).await.unwrap();
    eventually("duplicate acked", || {
        let broker = broker.clone();
        async move { broker.acked().await == 2 }
    })
    .await;

    assert_eq!(pipeline.views.get("agg-1").await.unwrap().unwrap(), first);
    assert_eq!(pipeline.views.len().await, 1);

    pipeline.consumer.stop();
    pipeline.consumer.wait_stopped().await;
}

#[tokio::test]
async fn mutation_before_creation_is_retried_until_row_exists() {
    let pipeline = start_pipeline(broker_config());

    // Publish out of order: the change reaches the projector first.
    pipeline
        .broker
        .publish(&raw_event(
            "agg-1",
            2,
            UserEvent::PasswordChanged(PasswordChanged {
                new_password_hash: "h2".to_string(),
            }),
        ))
        .await
        .unwrap();
    pipeline
        .broker
        .publish(&raw_event(
            "agg-1",
            1,
            UserEvent::Registered(UserRegistered {
                username: "alice".to_string(),
                password_hash: "h1".to_string(),
            }),
        ))
        .await
        .unwrap();

    let views = pipeline.views.clone();
    eventually("row at v2", || {
        let views = views.clone();
        async move { matches!(views.get("agg-1").await, Ok(Some(row)) if row.version == 2) }
    })
    .await;

    let row = views.get("agg-1").await.unwrap().unwrap();
    assert_eq!(row.password_hash, "h2");
    assert_eq!(pipeline.broker.delivery_log().await, vec![0, 0, 1]);
    assert!(pipeline.broker.dead_letters().await.is_empty());

    pipeline.consumer.stop();
    pipeline.consumer.wait_stopped().await;
}

#[tokio::test]
async fn consumer_reconnects_and_redeclares_after_connection_loss() {
    let pipeline = start_pipeline(broker_config());
    assert!(pipeline.consumer.wait_for(ConsumerState::Consuming).await);
    assert_eq!(pipeline.broker.connections().await, 1);

    pipeline.broker.disconnect_all().await;

    let broker = pipeline.broker.clone();
    eventually("second connection", || {
        let broker = broker.clone();
        async move { broker.connections().await == 2 }
    })
    .await;

    pipeline
        .commands
        .register_user("alice", "correct-horse")
        .await
        .unwrap();

    let views = pipeline.views.clone();
    eventually("alice projected after reconnect", || {
        let views = views.clone();
        async move { matches!(views.find_by_username("alice").await, Ok(Some(_))) }
    })
    .await;

    pipeline.consumer.stop();
    pipeline.consumer.wait_stopped().await;
}

#[tokio::test]
async fn stop_during_reconnect_backoff_returns_promptly() {
    let config = BrokerConfig {
        reconnect_delay: Duration::from_secs(60),
        ..broker_config()
    };
    let pipeline = start_pipeline_refusing(config).await;

    let broker = pipeline.broker.clone();
    eventually("first failed connect", || {
        let broker = broker.clone();
        async move { broker.connect_attempts().await >= 1 }
    })
    .await;

    pipeline.consumer.stop();
    tokio::time::timeout(Duration::from_secs(1), pipeline.consumer.wait_stopped())
        .await
        .expect("consumer should stop without waiting out the backoff");

    assert_eq!(pipeline.consumer.state(), ConsumerState::Stopped);
    assert_eq!(broker.connect_attempts().await, 1);
}

async fn start_pipeline_refusing(config: BrokerConfig) -> Pipeline {
    let store = Arc::new(MemoryEventStore::new());
    let views = Arc::new(MemoryUserViews::new());
    let broker = MemoryBroker::new();
    broker.set_refuse_connections(true).await;
    let registry = registry();

    let commands = UserCommandHandler::new(
        store.clone(),
        registry.clone(),
        Arc::new(broker.clone()),
        Arc::new(PrefixHasher),
        "itest",
    );
    let consumer = EventConsumer::new(
        broker.clone(),
        config,
        registry,
        Arc::new(UsersProjection::new(views.clone())),
    )
    .start();

    Pipeline {
        commands,
        store,
        views,
        broker,
        consumer,
    }
}

#[tokio::test]
async fn stop_is_idempotent() {
    let pipeline = start_pipeline(broker_config());
    assert!(pipeline.consumer.wait_for(ConsumerState::Consuming).await);

    let other = pipeline.consumer.clone();
    pipeline.consumer.stop();
    other.stop();

    tokio::join!(pipeline.consumer.wait_stopped(), other.wait_stopped());
    assert_eq!(other.state(), ConsumerState::Stopped);

    // Stopping a stopped consumer is a no-op.
    pipeline.consumer.stop();
    pipeline.consumer.wait_stopped().await;
}

#[tokio::test]
async fn duplicate_append_conflicts_and_keeps_one_copy() {
    let store = MemoryEventStore::new();
    let event = raw_event(
        "agg-1",
        1,
        UserEvent::Registered(UserRegistered {
            username: "alice".to_string(),
            password_hash: "h1".to_string(),
        }),
    );

    store.save_events("agg-1", &[event.clone()]).await.unwrap();
    let err = store.save_events("agg-1", &[event]).await.unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(store.get_events("agg-1").await.unwrap().len(), 1);
}
