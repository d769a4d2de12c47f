//! In-memory event store and read model.
//!
//! Same contracts as the Postgres implementations; used by tests and for
//! running the pipeline without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dcart_events::RawEvent;
use tokio::sync::RwLock;

use super::event_store::check_batch;
use super::{DbError, EventStore, UserView, UserViewStore, ViewUpdate};

/// Event store holding every stream in a map.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    streams: RwLock<HashMap<String, Vec<RawEvent>>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored event, streams in arbitrary order.
    pub async fn all_events(&self) -> Vec<RawEvent> {
        let streams = self.streams.read().await;
        streams.values().flatten().cloned().collect()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn save_events(&self, aggregate_id: &str, events: &[RawEvent]) -> Result<(), DbError> {
        check_batch(aggregate_id, events)?;

        // The write guard is the per-aggregate lock; validate the whole
        // batch before touching the stream so a conflict leaves it unchanged.
        let mut streams = self.streams.write().await;
        let mut latest_version = streams
            .get(aggregate_id)
            .and_then(|stream| stream.last())
            .map_or(0, |event| event.version);

        for event in events {
            let expected = latest_version + 1;
            if event.version != expected {
                return Err(DbError::ConcurrencyConflict {
                    aggregate_id: aggregate_id.to_string(),
                    expected,
                    actual: event.version,
                });
            }
            latest_version = event.version;
        }

        streams
            .entry(aggregate_id.to_string())
            .or_default()
            .extend(events.iter().cloned());
        Ok(())
    }

    async fn get_events(&self, aggregate_id: &str) -> Result<Vec<RawEvent>, DbError> {
        let streams = self.streams.read().await;
        Ok(streams.get(aggregate_id).cloned().unwrap_or_default())
    }

    async fn get_events_by_type(&self, event_type: &str) -> Result<Vec<RawEvent>, DbError> {
        let streams = self.streams.read().await;
        let mut events: Vec<RawEvent> = streams
            .values()
            .flatten()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect();
        events.sort_by_key(|event| event.occurred_at);
        Ok(events)
    }
}

/// User read model held in a map.
#[derive(Debug, Default)]
pub struct MemoryUserViews {
    rows: RwLock<HashMap<String, UserView>>,
}

impl MemoryUserViews {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

#[async_trait]
impl UserViewStore for MemoryUserViews {
    async fn insert_if_absent(&self, view: &UserView) -> Result<bool, DbError> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(&view.user_id) {
            return Ok(false);
        }
        rows.insert(view.user_id.clone(), view.clone());
        Ok(true)
    }

    async fn apply_password_change(
        &self,
        user_id: &str,
        password_hash: &str,
        version: i32,
        at: DateTime<Utc>,
    ) -> Result<ViewUpdate, DbError> {
        let mut rows = self.rows.write().await;
        let Some(row) = rows.get_mut(user_id) else {
            return Ok(ViewUpdate::Missing);
        };

        if row.version >= version {
            return Ok(ViewUpdate::Stale {
                stored_version: row.version,
            });
        }

        row.password_hash = password_hash.to_string();
        row.version = version;
        row.updated_at = at;
        Ok(ViewUpdate::Applied)
    }

    async fn get(&self, user_id: &str) -> Result<Option<UserView>, DbError> {
        Ok(self.rows.read().await.get(user_id).cloned())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<UserView>, DbError> {
        let rows = self.rows.read().await;
        Ok(rows.values().find(|row| row.username == username).cloned())
    }
}
