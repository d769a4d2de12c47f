//! Database error types.

use dcart_events::EventError;
use thiserror::Error;

/// Database operation errors.
#[derive(Debug, Error)]
pub enum DbError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Set DCART_MIGRATIONS_DIR.")]
    MigrationDirNotFound { tried: String },

    /// Version conflict on append (optimistic concurrency).
    ///
    /// The caller's aggregate is stale or a concurrent writer committed
    /// first; reload and retry the command.
    #[error("concurrency conflict on {aggregate_id}: expected version {expected}, got {actual}")]
    ConcurrencyConflict {
        aggregate_id: String,
        expected: i32,
        actual: i32,
    },

    /// Append was called without events.
    #[error("no events to append for {0}")]
    EmptyAppend(String),

    /// An event in the batch belongs to another aggregate.
    #[error("event for {actual} appended to stream {expected}")]
    AggregateMismatch { expected: String, actual: String },

    /// A stored row could not be turned back into an event.
    #[error("corrupt event row: {0}")]
    Event(#[from] EventError),
}

impl DbError {
    /// True for version conflicts, which callers resolve by reloading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, DbError::ConcurrencyConflict { .. })
    }
}
