//! Users projection handler.
//!
//! Handles user.registered and user.passwordChanged events, maintaining the
//! users_view table.

use std::sync::Arc;

use async_trait::async_trait;
use dcart_events::{EventEnvelope, PasswordChanged, UserEvent, UserRegistered};
use tracing::{debug, instrument};

use crate::db::{UserView, UserViewStore, ViewUpdate};

use super::{ProjectionError, ProjectionOutcome, ProjectionResult, Projector};

/// Projection handler for users.
#[derive(Clone)]
pub struct UsersProjection {
    views: Arc<dyn UserViewStore>,
}

impl UsersProjection {
    pub fn new(views: Arc<dyn UserViewStore>) -> Self {
        Self { views }
    }

    /// Insert the row unless it already exists.
    async fn handle_registered(
        &self,
        event: &EventEnvelope<UserEvent>,
        payload: &UserRegistered,
    ) -> ProjectionResult<ProjectionOutcome> {
        let view = UserView {
            user_id: event.aggregate_id.clone(),
            username: payload.username.clone(),
            password_hash: payload.password_hash.clone(),
            version: event.version,
            created_at: event.occurred_at,
            updated_at: event.occurred_at,
        };

        if self.views.insert_if_absent(&view).await? {
            debug!(username = %payload.username, "Inserted user into users_view");
            Ok(ProjectionOutcome::Applied)
        } else {
            debug!("User row already present, skipping redelivery");
            Ok(ProjectionOutcome::Skipped)
        }
    }

    /// Advance the row only for a strictly newer version.
    async fn handle_password_changed(
        &self,
        event: &EventEnvelope<UserEvent>,
        payload: &PasswordChanged,
    ) -> ProjectionResult<ProjectionOutcome> {
        let update = self
            .views
            .apply_password_change(
                &event.aggregate_id,
                &payload.new_password_hash,
                event.version,
                event.occurred_at,
            )
            .await?;

        match update {
            ViewUpdate::Applied => Ok(ProjectionOutcome::Applied),
            ViewUpdate::Stale { stored_version } => {
                debug!(stored_version, "Stale password change, skipping");
                Ok(ProjectionOutcome::Skipped)
            }
            ViewUpdate::Missing => Err(ProjectionError::ViewMissing {
                aggregate_id: event.aggregate_id.clone(),
                version: event.version,
            }),
        }
    }
}

#[async_trait]
impl Projector for UsersProjection {
    fn name(&self) -> &'static str {
        "users"
    }

    #[instrument(
        skip(self, event),
        fields(aggregate_id = %event.aggregate_id, version = event.version, event_type = event.event_type())
    )]
    async fn project(
        &self,
        event: &EventEnvelope<UserEvent>,
    ) -> ProjectionResult<ProjectionOutcome> {
        match &event.payload {
            UserEvent::Registered(payload) => self.handle_registered(event, payload).await,
            UserEvent::PasswordChanged(payload) => {
                self.handle_password_changed(event, payload).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryUserViews;
    use chrono::{Duration, Utc};
    use dcart_events::AggregateType;

    fn envelope(version: i32, payload: UserEvent) -> EventEnvelope<UserEvent> {
        EventEnvelope {
            aggregate_id: "agg-1".to_string(),
            aggregate_type: AggregateType::User,
            version,
            occurred_at: Utc::now() + Duration::seconds(i64::from(version)),
            payload,
        }
    }

    fn registered() -> EventEnvelope<UserEvent> {
        envelope(
            1,
            UserEvent::Registered(UserRegistered {
                username: "alice".to_string(),
                password_hash: "h1".to_string(),
            }),
        )
    }

    fn changed(version: i32, hash: &str) -> EventEnvelope<UserEvent> {
        envelope(
            version,
            UserEvent::PasswordChanged(PasswordChanged {
                new_password_hash: hash.to_string(),
            }),
        )
    }

    fn projection() -> (UsersProjection, Arc<MemoryUserViews>) {
        let views = Arc::new(MemoryUserViews::new());
        (UsersProjection::new(views.clone()), views)
    }

    #[tokio::test]
    async fn test_registered_redelivery_is_noop() {
        let (projection, views) = projection();
        let event = registered();

        assert_eq!(
            projection.project(&event).await.unwrap(),
            ProjectionOutcome::Applied
        );
        let first = views.get("agg-1").await.unwrap().unwrap();

        assert_eq!(
            projection.project(&event).await.unwrap(),
            ProjectionOutcome::Skipped
        );
        let second = views.get("agg-1").await.unwrap().unwrap();

        assert_eq!(first, second);
        assert_eq!(second.version, 1);
    }

    #[tokio::test]
    async fn test_older_password_change_cannot_overwrite_newer() {
        let (projection, views) = projection();
        projection.project(&registered()).await.unwrap();
        projection.project(&changed(3, "h3")).await.unwrap();

        let outcome = projection.project(&changed(2, "h2")).await.unwrap();

        assert_eq!(outcome, ProjectionOutcome::Skipped);
        let row = views.get("agg-1").await.unwrap().unwrap();
        assert_eq!(row.password_hash, "h3");
        assert_eq!(row.version, 3);
    }

    #[tokio::test]
    async fn test_change_before_registration_is_an_error() {
        let (projection, _views) = projection();

        let err = projection.project(&changed(2, "h2")).await.unwrap_err();

        assert!(matches!(
            err,
            ProjectionError::ViewMissing { version: 2, .. }
        ));
    }

    #[test]
    fn test_users_projection_name() {
        let (projection, _) = projection();
        assert_eq!(projection.name(), "users");
    }
}
