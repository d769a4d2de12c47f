//! # dcart-events
//!
//! Event model and aggregate reconstruction for the dcart auth service.
//!
//! ## Design Principles
//!
//! - Events are immutable records of validated state transitions
//! - Every event belongs to exactly one aggregate and carries its version
//! - Per aggregate, persisted versions are contiguous from 1
//! - Aggregate state is never cached; it is rebuilt from the full history
//!
//! ## Event Envelope
//!
//! All events share a common envelope with:
//! - Aggregate identity (`aggregate_type`, `aggregate_id`)
//! - Aggregate ordering (`version`)
//! - Occurrence time (`occurred_at`)
//!
//! [`RawEvent`] is the same envelope with the payload still encoded; it is
//! what the store persists and what the broker carries. [`EventRegistry`]
//! turns it back into a typed [`EventEnvelope`].
//!
//! ## Event Types
//!
//! - User events (`user.registered`, `user.passwordChanged`)

mod aggregate;
mod envelope;
mod error;
mod registry;
mod types;
mod user;

pub use aggregate::{reconstruct, AggregateRoot};
pub use envelope::*;
pub use error::{EventError, UserError};
pub use registry::EventRegistry;
pub use types::*;
pub use user::{register_events, Password, User};
