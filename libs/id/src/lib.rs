//! # dcart-id
//!
//! Aggregate identifiers for the dcart auth service.
//!
//! ## Design Principles
//!
//! - User identity is derived from the natural key (the username), so the same
//!   username always maps to the same aggregate stream
//! - IDs have one canonical string form with strict parsing
//! - A namespace is mixed into the hash so separate deployments never share ids
//!
//! ## ID Format
//!
//! `UserId` is the first 32 lowercase hex digits of
//! `SHA-256(namespace || username)`:
//!
//! - `3b5f0c2e9a7d4e1f8c6b2a9d0e4f7a1c`

mod error;
mod types;

pub use error::IdError;
pub use types::*;
