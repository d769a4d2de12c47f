//! Event type definitions for user events.
//!
//! Each event type has a payload struct; `UserEvent` is the closed sum over them.

use serde::{Deserialize, Serialize};

use crate::{DomainEvent, EventError, EventPayload};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    pub const USER_REGISTERED: &str = "user.registered";
    pub const USER_PASSWORD_CHANGED: &str = "user.passwordChanged";
}

// =============================================================================
// User Events
// =============================================================================

/// Payload for user.registered event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRegistered {
    pub username: String,
    pub password_hash: String,
}

impl EventPayload for UserRegistered {
    const EVENT_TYPE: &'static str = event_types::USER_REGISTERED;
}

/// Payload for user.passwordChanged event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordChanged {
    pub new_password_hash: String,
}

impl EventPayload for PasswordChanged {
    const EVENT_TYPE: &'static str = event_types::USER_PASSWORD_CHANGED;
}

/// Every event the user aggregate emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    Registered(UserRegistered),
    PasswordChanged(PasswordChanged),
}

impl From<UserRegistered> for UserEvent {
    fn from(payload: UserRegistered) -> Self {
        UserEvent::Registered(payload)
    }
}

impl From<PasswordChanged> for UserEvent {
    fn from(payload: PasswordChanged) -> Self {
        UserEvent::PasswordChanged(payload)
    }
}

impl DomainEvent for UserEvent {
    fn event_type(&self) -> &'static str {
        match self {
            UserEvent::Registered(_) => UserRegistered::EVENT_TYPE,
            UserEvent::PasswordChanged(_) => PasswordChanged::EVENT_TYPE,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, EventError> {
        let bytes = match self {
            UserEvent::Registered(p) => serde_json::to_vec(p)?,
            UserEvent::PasswordChanged(p) => serde_json::to_vec(p)?,
        };
        Ok(bytes)
    }
}
