//! Typed ID definitions.
//!
//! `UserId` is hash-derived rather than random so that the write side can
//! detect an existing registration by loading the stream for the username.

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest.
const USER_ID_LEN: usize = 32;

/// Identity of a user aggregate.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(String);

impl UserId {
    /// Derives the id for `username` within `namespace`.
    #[must_use]
    pub fn derive(namespace: &str, username: &str) -> Self {
        let mut hasher = Sha256::new();
        if !namespace.is_empty() {
            hasher.update(namespace.as_bytes());
        }
        hasher.update(username.as_bytes());

        let mut encoded = hex::encode(hasher.finalize());
        encoded.truncate(USER_ID_LEN);
        Self(encoded)
    }

    /// Parses an ID from its canonical string form.
    pub fn parse(s: &str) -> Result<Self, crate::IdError> {
        if s.is_empty() {
            return Err(crate::IdError::Empty);
        }

        let actual = s.chars().count();
        if actual != USER_ID_LEN {
            return Err(crate::IdError::InvalidLength {
                expected: USER_ID_LEN,
                actual,
            });
        }

        if let Some((position, found)) = s
            .chars()
            .enumerate()
            .find(|(_, c)| !matches!(c, '0'..='9' | 'a'..='f'))
        {
            return Err(crate::IdError::InvalidCharacter { position, found });
        }

        Ok(Self(s.to_string()))
    }

    /// Returns the canonical string form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for UserId {
    type Err = crate::IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for UserId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
