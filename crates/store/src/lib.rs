//! Tessera store: the versioned key-value contract every backend implements,
//! plus the in-RAM backend used by tests and single-process deployments.

#![forbid(unsafe_code)]

use std::time::Duration;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tessera_core::{Result, Version};

mod mem;
pub mod watch;

pub use mem::MemStore;
pub use watch::{EventBus, WatchStream};

/// A stored value together with the version of its last write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
    pub version: Version,
    /// Time left before the key expires, if a TTL is attached.
    pub ttl: Option<Duration>,
}

impl Entry {
    /// Remaining TTL rounded up to whole seconds.
    pub fn ttl_secs(&self) -> Option<u64> {
        self.ttl.map(|d| {
            let secs = d.as_secs();
            if d.subsec_nanos() > 0 { secs + 1 } else { secs }
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    Created,
    Updated,
    Deleted,
    /// The key's TTL elapsed and the store removed it.
    Expired,
}

/// Change notification emitted by a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub kind: EventKind,
    pub key: String,
    /// New value for writes; last known value for removals.
    pub value: Option<Vec<u8>>,
    /// Store revision at which the change happened.
    pub version: Version,
}

/// Ordered, finite stream of entries produced by a range scan.
pub type EntryStream = BoxStream<'static, Result<Entry>>;

/// Backend contract: per-key atomic writes guarded by versions, prefix scans,
/// optional per-key TTL and a change stream.
///
/// Every successful write returns a version greater than any previously
/// issued by the same store.
#[async_trait::async_trait]
pub trait VersionedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Entry>;

    /// Write `value` only if `key` is absent. Fails with `AlreadyExists`.
    async fn create_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<Version>;

    /// Replace `value` only if the current version equals `expected`.
    /// Fails with `NotFound` if absent and `Conflict` if the version moved.
    /// The TTL of the key after the write is exactly `ttl` (none clears it).
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Version,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<Version>;

    /// Remove `key`, optionally guarded by `expected`.
    async fn delete(&self, key: &str, expected: Option<Version>) -> Result<()>;

    /// Entries whose key starts with `prefix`, in lexicographic key order.
    async fn list(&self, prefix: &str) -> Result<EntryStream>;

    /// Subscribe to changes of keys starting with `prefix`.
    async fn watch(&self, prefix: &str) -> Result<WatchStream>;
}

/// TTLs, when present, must be positive.
pub fn check_ttl(ttl: Option<Duration>) -> Result<()> {
    match ttl {
        Some(d) if d.is_zero() => Err(tessera_core::Error::InvalidInput("ttl must be positive".into())),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_secs_rounds_up() {
        let mut e = Entry { key: "k".into(), value: vec![], version: Version::new(1), ttl: None };
        assert_eq!(e.ttl_secs(), None);
        e.ttl = Some(Duration::from_secs(30));
        assert_eq!(e.ttl_secs(), Some(30));
        e.ttl = Some(Duration::from_millis(29_001));
        assert_eq!(e.ttl_secs(), Some(30));
    }
}
