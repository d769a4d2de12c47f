//! Credential hashing seam.
//!
//! Hashing itself lives outside this crate; the command handler only needs
//! something that can hash and compare.

/// Hashing failed inside the hasher implementation.
#[derive(Debug, thiserror::Error)]
#[error("credential hashing failed: {0}")]
pub struct HashError(pub String);

/// Hashes and verifies passwords.
pub trait CredentialHasher: Send + Sync {
    fn hash(&self, password: &str) -> Result<String, HashError>;

    /// Whether `password` matches `hash`.
    fn compare(&self, hash: &str, password: &str) -> bool;
}
