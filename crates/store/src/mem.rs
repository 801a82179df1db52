use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use futures::StreamExt;
use tessera_core::{Error, Result, Version};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{check_ttl, Entry, EntryStream, EventBus, EventKind, StoreEvent, VersionedStore, WatchStream};

/// Longest TTL honoured as a real deadline; anything longer is clamped.
const MAX_TTL: Duration = Duration::from_secs(86_400 * 365 * 30);

fn deadline(now: Instant, ttl: Duration) -> Option<Instant> { now.checked_add(ttl.min(MAX_TTL)) }

struct Record {
    value: Vec<u8>,
    version: Version,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    revision: u64,
    data: BTreeMap<String, Record>,
    /// Min-heap of (deadline, key, version). Entries whose record has since
    /// been rewritten or removed are stale and skipped on pop.
    expiry: BinaryHeap<Reverse<(Instant, String, Version)>>,
}

impl Inner {
    fn bump(&mut self) -> Version {
        self.revision += 1;
        Version::new(self.revision)
    }

    fn schedule(&mut self, key: &str, version: Version, expires_at: Option<Instant>) {
        if let Some(at) = expires_at {
            self.expiry.push(Reverse((at, key.to_string(), version)));
        }
    }

    /// Drop every record whose deadline is at or before `now`.
    fn purge_expired(&mut self, now: Instant) -> Vec<StoreEvent> {
        let mut out = Vec::new();
        while let Some(Reverse((at, _, _))) = self.expiry.peek() {
            if *at > now { break; }
            let Some(Reverse((at, key, version))) = self.expiry.pop() else { break };
            let live = self
                .data
                .get(&key)
                .map(|r| r.version == version && r.expires_at == Some(at))
                .unwrap_or(false);
            if !live { continue; }
            if let Some(rec) = self.data.remove(&key) {
                let rev = self.bump();
                debug!(key = %key, "ttl elapsed; key expired");
                out.push(StoreEvent { kind: EventKind::Expired, key, value: Some(rec.value), version: rev });
            }
        }
        if !out.is_empty() {
            metrics::counter!("store_ttl_expired_total", out.len() as u64);
        }
        out
    }

    fn next_deadline(&self) -> Option<Instant> { self.expiry.peek().map(|Reverse((at, _, _))| *at) }

    fn entry(&self, key: &str, rec: &Record, now: Instant) -> Entry {
        Entry {
            key: key.to_string(),
            value: rec.value.clone(),
            version: rec.version,
            ttl: rec.expires_at.map(|at| at.saturating_duration_since(now)),
        }
    }
}

/// In-RAM versioned store.
///
/// TTLs run on `tokio::time`, so paused test clocks drive expiry. Every
/// operation purges elapsed keys first; once a TTL is set inside a runtime a
/// background sweeper also wakes at the earliest deadline, so watchers see
/// `Expired` without further traffic. TTLs beyond 30 years are clamped.
#[derive(Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
    events: EventBus,
    wake: Arc<Notify>,
    sweeping: AtomicBool,
    shutdown: CancellationToken,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    /// Latest revision issued by this store.
    pub fn revision(&self) -> Result<Version> {
        Ok(Version::new(self.lock()?.revision))
    }

    /// Number of live keys.
    pub fn len(&self) -> Result<usize> {
        let (n, evs) = {
            let mut g = self.lock()?;
            let evs = g.purge_expired(Instant::now());
            (g.data.len(), evs)
        };
        self.events.publish_all(evs);
        Ok(n)
    }

    pub fn is_empty(&self) -> Result<bool> { Ok(self.len()? == 0) }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| Error::Unavailable(anyhow!("mem store lock poisoned")))
    }

    /// Run `f` against purged state, then publish expiry events plus whatever
    /// `f` emitted once the lock is released.
    fn with_state<T>(&self, f: impl FnOnce(&mut Inner, Instant, &mut Vec<StoreEvent>) -> Result<T>) -> Result<T> {
        let now = Instant::now();
        let (res, evs) = {
            let mut g = self.lock()?;
            let mut evs = g.purge_expired(now);
            let res = f(&mut *g, now, &mut evs);
            (res, evs)
        };
        self.events.publish_all(evs);
        res
    }

    /// Start the sweeper on first use and nudge it to re-read the earliest deadline.
    fn kick_sweeper(&self) {
        if !self.sweeping.swap(true, Ordering::SeqCst) {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(sweep(
                        self.inner.clone(),
                        self.events.clone(),
                        self.wake.clone(),
                        self.shutdown.clone(),
                    ));
                }
                Err(_) => {
                    self.sweeping.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
        self.wake.notify_one();
    }
}

impl Drop for MemStore {
    fn drop(&mut self) { self.shutdown.cancel(); }
}

async fn sweep(inner: Arc<Mutex<Inner>>, events: EventBus, wake: Arc<Notify>, shutdown: CancellationToken) {
    debug!("mem store ttl sweeper started");
    loop {
        let next = {
            let Ok(mut g) = inner.lock() else { break };
            let evs = g.purge_expired(Instant::now());
            let next = g.next_deadline();
            drop(g);
            events.publish_all(evs);
            next
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = wake.notified() => {}
            _ = async {
                match next {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {}
        }
    }
    debug!("mem store ttl sweeper stopped");
}

#[async_trait::async_trait]
impl VersionedStore for MemStore {
    async fn get(&self, key: &str) -> Result<Entry> {
        self.with_state(|st, now, _| {
            st.data.get(key).map(|r| st.entry(key, r, now)).ok_or_else(|| Error::not_found(key))
        })
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<Version> {
        check_ttl(ttl)?;
        let version = self.with_state(|st, now, evs| {
            if st.data.contains_key(key) {
                return Err(Error::already_exists(key));
            }
            let version = st.bump();
            let expires_at = ttl.and_then(|d| deadline(now, d));
            st.schedule(key, version, expires_at);
            evs.push(StoreEvent { kind: EventKind::Created, key: key.to_string(), value: Some(value.clone()), version });
            st.data.insert(key.to_string(), Record { value, version, expires_at });
            Ok(version)
        })?;
        if ttl.is_some() {
            self.kick_sweeper();
        }
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Version,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<Version> {
        check_ttl(ttl)?;
        let version = self.with_state(|st, now, evs| {
            let current = st.data.get(key).map(|r| r.version).ok_or_else(|| Error::not_found(key))?;
            if current != expected {
                return Err(Error::conflict(key, format!("expected version {}, found {}", expected, current)));
            }
            let version = st.bump();
            let expires_at = ttl.and_then(|d| deadline(now, d));
            st.schedule(key, version, expires_at);
            evs.push(StoreEvent { kind: EventKind::Updated, key: key.to_string(), value: Some(value.clone()), version });
            st.data.insert(key.to_string(), Record { value, version, expires_at });
            Ok(version)
        })?;
        if ttl.is_some() {
            self.kick_sweeper();
        }
        Ok(version)
    }

    async fn delete(&self, key: &str, expected: Option<Version>) -> Result<()> {
        self.with_state(|st, _, evs| {
            let current = st.data.get(key).map(|r| r.version).ok_or_else(|| Error::not_found(key))?;
            if let Some(expected) = expected {
                if current != expected {
                    return Err(Error::conflict(key, format!("expected version {}, found {}", expected, current)));
                }
            }
            let rec = st.data.remove(key).ok_or_else(|| Error::not_found(key))?;
            let version = st.bump();
            evs.push(StoreEvent { kind: EventKind::Deleted, key: key.to_string(), value: Some(rec.value), version });
            Ok(())
        })
    }

    async fn list(&self, prefix: &str) -> Result<EntryStream> {
        let entries = self.with_state(|st, now, _| {
            Ok(st
                .data
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, r)| st.entry(k, r, now))
                .collect::<Vec<_>>())
        })?;
        Ok(futures::stream::iter(entries.into_iter().map(Ok)).boxed())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        Ok(self.events.subscribe(prefix))
    }
}
