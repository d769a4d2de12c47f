//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has the wrong number of characters.
    #[error("invalid ID length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The ID contains a character outside lowercase hex.
    #[error("invalid character {found:?} at position {position}")]
    InvalidCharacter { position: usize, found: char },
}
