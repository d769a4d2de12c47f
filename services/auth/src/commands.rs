//! Write side: user commands over the event store.
//!
//! Every command rebuilds the user from its full history, applies one domain
//! operation, appends the resulting events and then publishes them. The
//! append is the commit point; publishing happens strictly after it and a
//! failed publish never undoes it.

use std::sync::Arc;

use chrono::Utc;
use dcart_events::{
    reconstruct, AggregateRoot, EventEnvelope, EventError, EventRegistry, Password, RawEvent,
    User, UserError, UserEvent,
};
use dcart_id::UserId;
use tracing::{info, instrument, warn};

use crate::db::{DbError, EventStore};
use crate::messaging::EventPublisher;
use crate::security::{CredentialHasher, HashError};

/// Errors returned by command handling.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("username {0} is already taken")]
    AlreadyExists(String),

    #[error("user {0} not found")]
    NotFound(String),

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error(transparent)]
    Domain(#[from] UserError),

    /// Another writer appended to the aggregate first; retry the command.
    #[error("concurrent modification of {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(DbError),

    #[error("event error: {0}")]
    Event(#[from] EventError),

    #[error(transparent)]
    Hashing(#[from] HashError),
}

impl From<DbError> for CommandError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::ConcurrencyConflict { aggregate_id, .. } => CommandError::Conflict(aggregate_id),
            other => CommandError::Storage(other),
        }
    }
}

/// Result of a command that appended events.
#[derive(Debug)]
pub struct CommandReceipt {
    /// The user after the command.
    pub user: User,
    /// Events that were stored but could not be published.
    pub unpublished: Vec<RawEvent>,
}

/// Handles user commands.
#[derive(Clone)]
pub struct UserCommandHandler {
    store: Arc<dyn EventStore>,
    registry: Arc<EventRegistry<UserEvent>>,
    publisher: Arc<dyn EventPublisher>,
    hasher: Arc<dyn CredentialHasher>,
    namespace: String,
}

impl UserCommandHandler {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<EventRegistry<UserEvent>>,
        publisher: Arc<dyn EventPublisher>,
        hasher: Arc<dyn CredentialHasher>,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            hasher,
            namespace: namespace.into(),
        }
    }

    /// The id a username maps to.
    pub fn user_id(&self, username: &str) -> UserId {
        UserId::derive(&self.namespace, username)
    }

    #[instrument(skip(self, password))]
    pub async fn register_user(
        &self,
        username: &str,
        password: &str,
    ) -> Result<CommandReceipt, CommandError> {
        let id = self.user_id(username);
        if !self.store.get_events(id.as_str()).await?.is_empty() {
            return Err(CommandError::AlreadyExists(username.to_string()));
        }

        let password = Password::new(password)?;
        let hash = self.hasher.hash(password.as_str())?;
        let user = User::register(&id, username, hash, Utc::now())?;

        let receipt = self.commit(user).await.map_err(|e| match e {
            // Same id, so a concurrent registration of the name won.
            CommandError::Conflict(_) => CommandError::AlreadyExists(username.to_string()),
            other => other,
        })?;

        info!(user_id = %id, "Registered user");
        Ok(receipt)
    }

    /// Check a username/password pair. Unknown users and wrong passwords
    /// are indistinguishable.
    #[instrument(skip(self, password))]
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<User, CommandError> {
        let user = match self.load(&self.user_id(username)).await {
            Ok(user) => user,
            Err(CommandError::NotFound(_)) => return Err(CommandError::InvalidCredentials),
            Err(e) => return Err(e),
        };

        if !self.hasher.compare(user.password_hash(), password) {
            return Err(CommandError::InvalidCredentials);
        }
        Ok(user)
    }

    #[instrument(skip(self, old_password, new_password), fields(user_id = %user_id))]
    pub async fn change_password(
        &self,
        user_id: &UserId,
        old_password: &str,
        new_password: &str,
    ) -> Result<CommandReceipt, CommandError> {
        let mut user = self.load(user_id).await?;
        if !self.hasher.compare(user.password_hash(), old_password) {
            return Err(CommandError::InvalidCredentials);
        }

        let new_password = Password::new(new_password)?;
        let hash = self.hasher.hash(new_password.as_str())?;
        user.change_password(hash, Utc::now())?;

        let receipt = self.commit(user).await?;
        info!(version = receipt.user.version(), "Changed password");
        Ok(receipt)
    }

    /// Rebuild a user from its full history.
    pub async fn load(&self, user_id: &UserId) -> Result<User, CommandError> {
        let raws = self.store.get_events(user_id.as_str()).await?;
        if raws.is_empty() {
            return Err(CommandError::NotFound(user_id.to_string()));
        }

        let events = self.registry.decode_all(&raws)?;
        Ok(reconstruct::<User>(events)?)
    }

    /// Append the user's uncommitted events, then publish them.
    async fn commit(&self, mut user: User) -> Result<CommandReceipt, CommandError> {
        let raws = user
            .take_uncommitted_changes()
            .iter()
            .map(EventEnvelope::to_raw)
            .collect::<Result<Vec<_>, _>>()?;

        self.store.save_events(user.id(), &raws).await?;

        let mut unpublished = Vec::new();
        for raw in raws {
            if let Err(e) = self.publisher.publish(&raw).await {
                warn!(
                    error = %e,
                    aggregate_id = %raw.aggregate_id,
                    version = raw.version,
                    event_type = %raw.event_type,
                    "Event stored but not published"
                );
                unpublished.push(raw);
            }
        }

        Ok(CommandReceipt { user, unpublished })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryEventStore;
    use crate::messaging::MemoryBroker;
    use dcart_events::register_events;

    /// Reversible stand-in; never use outside tests.
    struct PrefixHasher;

    impl CredentialHasher for PrefixHasher {
        fn hash(&self, password: &str) -> Result<String, HashError> {
            Ok(format!("hashed:{password}"))
        }

        fn compare(&self, hash: &str, password: &str) -> bool {
            hash.strip_prefix("hashed:") == Some(password)
        }
    }

    fn handler() -> (UserCommandHandler, Arc<MemoryEventStore>, MemoryBroker) {
        let store = Arc::new(MemoryEventStore::new());
        let broker = MemoryBroker::new();
        let mut registry = EventRegistry::new();
        register_events(&mut registry);

        let handler = UserCommandHandler::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(broker.clone()),
            Arc::new(PrefixHasher),
            "test",
        );
        (handler, store, broker)
    }

    #[tokio::test]
    async fn test_register_stores_then_publishes() {
        let (handler, store, broker) = handler();

        let receipt = handler.register_user("alice", "correct-horse").await.unwrap();

        assert_eq!(receipt.user.version(), 1);
        assert!(receipt.unpublished.is_empty());
        assert_eq!(store.get_events(receipt.user.id()).await.unwrap().len(), 1);
        assert_eq!(broker.queue_len().await, 1);
    }

    #[tokio::test]
    async fn test_register_taken_username() {
        let (handler, store, _broker) = handler();
        handler.register_user("alice", "correct-horse").await.unwrap();

        let err = handler
            .register_user("alice", "other-password")
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::AlreadyExists(name) if name == "alice"));
        assert_eq!(store.all_events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_register_short_password() {
        let (handler, store, _broker) = handler();

        let err = handler.register_user("alice", "short").await.unwrap_err();

        assert!(matches!(
            err,
            CommandError::Domain(UserError::PasswordTooShort { min: 8 })
        ));
        assert!(store.all_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_authenticate() {
        let (handler, _store, _broker) = handler();
        handler.register_user("alice", "correct-horse").await.unwrap();

        let user = handler.authenticate("alice", "correct-horse").await.unwrap();
        assert_eq!(user.username(), "alice");

        assert!(matches!(
            handler.authenticate("alice", "wrong-horse").await,
            Err(CommandError::InvalidCredentials)
        ));
        assert!(matches!(
            handler.authenticate("bob", "correct-horse").await,
            Err(CommandError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn test_change_password_appends_next_version() {
        let (handler, _store, broker) = handler();
        let id = handler.user_id("alice");
        handler.register_user("alice", "correct-horse").await.unwrap();

        let receipt = handler
            .change_password(&id, "correct-horse", "battery-staple")
            .await
            .unwrap();

        assert_eq!(receipt.user.version(), 2);
        assert_eq!(broker.queue_len().await, 2);

        let reloaded = handler.load(&id).await.unwrap();
        assert_eq!(reloaded.version(), 2);
        assert!(reloaded.uncommitted_changes().is_empty());
        handler.authenticate("alice", "battery-staple").await.unwrap();
    }

    #[tokio::test]
    async fn test_change_password_requires_old_password() {
        let (handler, _store, _broker) = handler();
        let id = handler.user_id("alice");
        handler.register_user("alice", "correct-horse").await.unwrap();

        let err = handler
            .change_password(&id, "wrong-horse", "battery-staple")
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::InvalidCredentials));
        assert_eq!(handler.load(&id).await.unwrap().version(), 1);
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_append() {
        let (handler, store, broker) = handler();
        broker.set_reject_publishes(true).await;

        let receipt = handler.register_user("alice", "correct-horse").await.unwrap();

        assert_eq!(receipt.unpublished.len(), 1);
        assert_eq!(receipt.unpublished[0].version, 1);
        assert_eq!(store.get_events(receipt.user.id()).await.unwrap().len(), 1);
        assert_eq!(broker.queue_len().await, 0);
    }

    #[tokio::test]
    async fn test_load_unknown_user() {
        let (handler, _store, _broker) = handler();
        let err = handler.load(&handler.user_id("nobody")).await.unwrap_err();
        assert!(matches!(err, CommandError::NotFound(_)));
    }
}
