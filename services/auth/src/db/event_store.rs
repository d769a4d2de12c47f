//! Event store for append-only event log operations.
//!
//! The event store provides:
//! - Append events with optimistic concurrency control
//! - Query events by aggregate (for rebuilding aggregate state)
//! - Query events by event type

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dcart_events::{AggregateType, RawEvent};
use sqlx::{postgres::PgPool, postgres::PgRow, Row};
use tracing::{debug, instrument, warn};

use super::DbError;

/// Durable, per-aggregate append log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `events` to the stream of `aggregate_id` atomically.
    ///
    /// Each event must carry exactly the next version after the stream's
    /// latest persisted one.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ConcurrencyConflict` if any version does not follow
    /// on (a concurrent writer won, or the caller's aggregate is stale). No
    /// event of the batch is persisted in that case.
    async fn save_events(&self, aggregate_id: &str, events: &[RawEvent]) -> Result<(), DbError>;

    /// All events of an aggregate, in ascending version order.
    async fn get_events(&self, aggregate_id: &str) -> Result<Vec<RawEvent>, DbError>;

    /// All events of the given type, across aggregates.
    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<RawEvent>, DbError>;
}

/// A row from the events table.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub version: i32,
    pub occurred_at: DateTime<Utc>,
    pub payload: Vec<u8>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for EventRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            aggregate_id: row.try_get("aggregate_id")?,
            aggregate_type: row.try_get("aggregate_type")?,
            event_type: row.try_get("event_type")?,
            version: row.try_get("version")?,
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

impl TryFrom<EventRow> for RawEvent {
    type Error = DbError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(RawEvent {
            aggregate_type: AggregateType::parse(&row.aggregate_type)?,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            version: row.version,
            occurred_at: row.occurred_at,
            payload: row.payload,
        })
    }
}

/// Validate the shape of an append batch before touching storage.
pub(crate) fn check_batch(aggregate_id: &str, events: &[RawEvent]) -> Result<(), DbError> {
    if events.is_empty() {
        return Err(DbError::EmptyAppend(aggregate_id.to_string()));
    }

    if let Some(foreign) = events.iter().find(|e| e.aggregate_id != aggregate_id) {
        return Err(DbError::AggregateMismatch {
            expected: aggregate_id.to_string(),
            actual: foreign.aggregate_id.clone(),
        });
    }

    Ok(())
}

/// Postgres-backed event store.
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    /// Create a new event store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn rows_to_events(rows: Vec<EventRow>) -> Result<Vec<RawEvent>, DbError> {
        rows.into_iter().map(RawEvent::try_from).collect()
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn save_events(&self, aggregate_id: &str, events: &[RawEvent]) -> Result<(), DbError> {
        check_batch(aggregate_id, events)?;

        let mut tx = self.pool.begin().await.map_err(DbError::Query)?;

        // Serialize writers of this aggregate for the rest of the transaction.
        sqlx::query("SELECT 1 FROM events WHERE aggregate_id = $1 FOR UPDATE")
            .bind(aggregate_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::Query)?;

        let mut latest_version: i32 = sqlx::query(
            r#"
            SELECT COALESCE(MAX(version), 0) AS latest_version
            FROM events
            WHERE aggregate_id = $1
            "#,
        )
        .bind(aggregate_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(DbError::Query)?
        .get("latest_version");

        for event in events {
            let expected = latest_version + 1;
            if event.version != expected {
                warn!(
                    expected,
                    actual = event.version,
                    "Version conflict, rolling back append"
                );
                return Err(DbError::ConcurrencyConflict {
                    aggregate_id: aggregate_id.to_string(),
                    expected,
                    actual: event.version,
                });
            }

            sqlx::query(
                r#"
                INSERT INTO events (
                    aggregate_id,
                    aggregate_type,
                    event_type,
                    version,
                    occurred_at,
                    payload
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&event.aggregate_id)
            .bind(event.aggregate_type.to_string())
            .bind(&event.event_type)
            .bind(event.version)
            .bind(event.occurred_at)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // Primary key (aggregate_id, version) backstops the lock for
                // brand-new streams, where FOR UPDATE has no rows to hold.
                if let sqlx::Error::Database(ref db_err) = e {
                    if db_err.code().as_deref() == Some("23505") {
                        return DbError::ConcurrencyConflict {
                            aggregate_id: aggregate_id.to_string(),
                            expected,
                            actual: event.version,
                        };
                    }
                }
                DbError::Query(e)
            })?;

            latest_version = event.version;
        }

        tx.commit().await.map_err(DbError::Query)?;
        debug!(latest_version, "Appended events");
        Ok(())
    }

    async fn get_events(&self, aggregate_id: &str) -> Result<Vec<RawEvent>, DbError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT
                aggregate_id,
                aggregate_type,
                event_type,
                version,
                occurred_at,
                payload
            FROM events
            WHERE aggregate_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(aggregate_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Self::rows_to_events(rows)
    }

    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<RawEvent>, DbError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT
                aggregate_id,
                aggregate_type,
                event_type,
                version,
                occurred_at,
                payload
            FROM events
            WHERE event_type = $1
            ORDER BY occurred_at ASC
            "#,
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::Query)?;

        Self::rows_to_events(rows)
    }
}
