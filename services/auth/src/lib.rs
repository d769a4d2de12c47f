//! dcart auth service library.
//!
//! The crate ships the `auth-projector` binary; the library surface holds the
//! event-sourced write side (event store, command handler) and the broker
//! pipeline feeding the users read model, so both can be tested end to end.

pub mod commands;
pub mod config;
pub mod db;
pub mod messaging;
pub mod projections;
pub mod security;
