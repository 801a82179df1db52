//! Tessera core types: storage keys, version tokens and the error taxonomy
//! shared by stores and registries.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod key;

pub use key::{KeyBuilder, StorageKey};

/// Monotonically increasing token issued by a store on every successful write.
///
/// A version is only meaningful against the key it was issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    pub const fn new(v: u64) -> Self { Self(v) }

    pub const fn get(&self) -> u64 { self.0 }

    pub const fn next(&self) -> Self { Self(self.0 + 1) }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u64>()
            .map(Version)
            .map_err(|_| Error::InvalidInput(format!("invalid resource version {:?}", s)))
    }
}

impl From<u64> for Version {
    fn from(v: u64) -> Self { Self(v) }
}

/// Errors surfaced by stores and registries.
///
/// `Conflict` is the only kind retried locally (and only by update-like
/// operations); everything else propagates to the caller as-is.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {key}")]
    NotFound { key: String },
    #[error("already exists: {key}")]
    AlreadyExists { key: String },
    #[error("conflict on {key}: {reason}")]
    Conflict { key: String, reason: String },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("field is immutable: {field}")]
    ImmutableField { field: String },
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    #[error("codec error for {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn not_found(key: impl Into<String>) -> Self { Error::NotFound { key: key.into() } }

    pub fn already_exists(key: impl Into<String>) -> Self { Error::AlreadyExists { key: key.into() } }

    pub fn conflict(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Conflict { key: key.into(), reason: reason.into() }
    }

    pub fn immutable(field: impl Into<String>) -> Self { Error::ImmutableField { field: field.into() } }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound { .. }) }

    pub fn is_already_exists(&self) -> bool { matches!(self, Error::AlreadyExists { .. }) }

    pub fn is_conflict(&self) -> bool { matches!(self, Error::Conflict { .. }) }

    pub fn is_cancelled(&self) -> bool { matches!(self, Error::Cancelled(_)) }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod prelude {
    pub use super::{Error, KeyBuilder, Result, StorageKey, Version};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parses_and_orders() {
        let v: Version = "42".parse().unwrap();
        assert_eq!(v, Version::new(42));
        assert!(v < v.next());
        assert_eq!(v.to_string(), "42");
        assert!(matches!("abc".parse::<Version>(), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn error_kind_helpers() {
        assert!(Error::not_found("/a").is_not_found());
        assert!(Error::conflict("/a", "stale").is_conflict());
        assert!(!Error::conflict("/a", "stale").is_not_found());
        assert!(Error::already_exists("/a").is_already_exists());
    }
}
