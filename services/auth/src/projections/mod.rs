//! Read-model projections.
//!
//! A projection receives events from the broker consumer (at-least-once,
//! possibly reordered after retries) and folds them into a view table. Every
//! handler must therefore be idempotent: applying an event that the view has
//! already seen, or one older than what it holds, is a no-op.

mod users;

pub use users::UsersProjection;

use async_trait::async_trait;
use dcart_events::{EventEnvelope, UserEvent};

use crate::db::DbError;

/// Result type for projection operations.
pub type ProjectionResult<T> = Result<T, ProjectionError>;

/// Errors that can occur during projection processing.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("database error: {0}")]
    Database(#[from] DbError),

    /// A mutation arrived before the row it mutates was created.
    #[error("no view row for {aggregate_id} (event version {version})")]
    ViewMissing { aggregate_id: String, version: i32 },
}

/// What a projection did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionOutcome {
    /// The view changed.
    Applied,
    /// Duplicate or stale delivery; the view was left as it was.
    Skipped,
}

/// Applies consumed events to a read model.
#[async_trait]
pub trait Projector: Send + Sync {
    /// The name of this projection (used in logs).
    fn name(&self) -> &'static str;

    /// Apply a single event to the view.
    async fn project(&self, event: &EventEnvelope<UserEvent>)
        -> ProjectionResult<ProjectionOutcome>;
}
