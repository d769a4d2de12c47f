//! The user aggregate.

use chrono::{DateTime, Utc};
use dcart_id::UserId;

use crate::{
    AggregateRoot, AggregateType, EventEnvelope, EventRegistry, PasswordChanged, UserError,
    UserEvent, UserRegistered,
};

const MIN_PASSWORD_LEN: usize = 8;

/// A validated plaintext password, prior to hashing.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(raw: impl Into<String>) -> Result<Self, UserError> {
        let raw = raw.into();
        if raw.chars().count() < MIN_PASSWORD_LEN {
            return Err(UserError::PasswordTooShort {
                min: MIN_PASSWORD_LEN,
            });
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(***)")
    }
}

/// Register the user event kinds with `registry`.
pub fn register_events(registry: &mut EventRegistry<UserEvent>) {
    registry
        .register::<UserRegistered>()
        .register::<PasswordChanged>();
}

/// Event-sourced user state.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    id: String,
    version: i32,
    username: String,
    password_hash: String,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    changes: Vec<EventEnvelope<UserEvent>>,
}

impl User {
    /// Create a new user, recording `user.registered` at version 1.
    pub fn register(
        id: &UserId,
        username: &str,
        password_hash: String,
        at: DateTime<Utc>,
    ) -> Result<Self, UserError> {
        if username.trim().is_empty() {
            return Err(UserError::InvalidUsername);
        }

        let mut user = Self::empty(id.as_str());
        user.record(
            UserRegistered {
                username: username.to_string(),
                password_hash,
            }
            .into(),
            at,
        );
        Ok(user)
    }

    /// Replace the password hash, recording `user.passwordChanged`.
    pub fn change_password(
        &mut self,
        new_password_hash: String,
        at: DateTime<Utc>,
    ) -> Result<(), UserError> {
        if self.version == 0 {
            return Err(UserError::NotRegistered(self.id.clone()));
        }

        self.record(PasswordChanged { new_password_hash }.into(), at);
        Ok(())
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password_hash(&self) -> &str {
        &self.password_hash
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn record(&mut self, payload: UserEvent, at: DateTime<Utc>) {
        let event = EventEnvelope {
            aggregate_id: self.id.clone(),
            aggregate_type: Self::AGGREGATE_TYPE,
            version: self.version + 1,
            occurred_at: at,
            payload,
        };
        self.apply(&event);
        self.changes.push(event);
    }
}

impl AggregateRoot for User {
    type Event = UserEvent;

    const AGGREGATE_TYPE: AggregateType = AggregateType::User;

    fn empty(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: 0,
            username: String::new(),
            password_hash: String::new(),
            created_at: None,
            updated_at: None,
            changes: Vec::new(),
        }
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> i32 {
        self.version
    }

    fn uncommitted_changes(&self) -> &[EventEnvelope<UserEvent>] {
        &self.changes
    }

    fn take_uncommitted_changes(&mut self) -> Vec<EventEnvelope<UserEvent>> {
        std::mem::take(&mut self.changes)
    }

    fn apply(&mut self, event: &EventEnvelope<UserEvent>) {
        match &event.payload {
            UserEvent::Registered(payload) => {
                self.username = payload.username.clone();
                self.password_hash = payload.password_hash.clone();
                self.created_at = Some(event.occurred_at);
                self.updated_at = Some(event.occurred_at);
            }
            UserEvent::PasswordChanged(payload) => {
                self.password_hash = payload.new_password_hash.clone();
                self.updated_at = Some(event.occurred_at);
            }
        }
        self.version = event.version;
    }
}
