//! Tessera persistence: SQLite-backed `VersionedStore`.
//! Simple and synchronous under one connection; every operation is a single
//! transaction, so compare-and-swap is atomic per key.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use futures::StreamExt;
use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension, Transaction};
use tessera_core::{Error, Result, Version};
use tessera_store::{check_ttl, Entry, EntryStream, EventBus, EventKind, StoreEvent, VersionedStore, WatchStream};
use tracing::{debug, warn};

/// Wall clock in unix milliseconds; swappable for tests.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
    events: EventBus,
    clock: Clock,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("TESSERA_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path)
            .with_context(|| format!("opening sqlite db at {}", path))
            .map_err(Error::Unavailable)?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let db = rusqlite::Connection::open_in_memory()
            .context("opening in-memory sqlite db")
            .map_err(Error::Unavailable)?;
        Self::init(db)
    }

    /// Replace the clock used for TTL bookkeeping.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        let started = Instant::now();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                version    INTEGER NOT NULL,
                expires_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_kv_expires_at ON kv(expires_at) WHERE expires_at IS NOT NULL;
            CREATE TABLE IF NOT EXISTS revision (
                id  INTEGER PRIMARY KEY CHECK (id = 0),
                rev INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO revision(id, rev) VALUES (0, 0);",
        )
        .context("creating kv schema")
        .map_err(Error::Unavailable)?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self {
            db: Mutex::new(db),
            events: EventBus::default(),
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
        })
    }

    /// Spawn a task that purges keys as their TTL elapses, so watchers see
    /// `Expired` without other traffic. It sleeps until the earliest deadline,
    /// at most `max_idle` at a time, and stops once the store is dropped.
    /// Needs a tokio runtime.
    pub fn spawn_sweeper(self: &Arc<Self>, max_idle: Duration) -> tokio::task::JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            debug!("sqlite ttl sweeper started");
            loop {
                let wait = {
                    let Some(store) = store.upgrade() else { break };
                    if let Err(e) = store.txn("sweep", |_, _, _| Ok(())) {
                        warn!(error = %e, "ttl sweep failed");
                    }
                    match store.next_expiry() {
                        Ok(Some(at)) => {
                            let ms = at.saturating_sub((store.clock)()).max(1);
                            Duration::from_millis(ms as u64).min(max_idle)
                        }
                        Ok(None) => max_idle,
                        Err(e) => {
                            warn!(error = %e, "reading next ttl deadline failed");
                            max_idle
                        }
                    }
                };
                tokio::time::sleep(wait).await;
            }
            debug!("sqlite ttl sweeper stopped");
        })
    }

    fn next_expiry(&self) -> Result<Option<i64>> {
        self.lock()?
            .query_row("SELECT MIN(expires_at) FROM kv", [], |r| r.get(0))
            .map_err(db_err)
    }

    fn lock(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| Error::Unavailable(anyhow!("sqlite connection lock poisoned")))
    }

    /// Run `f` inside one transaction after purging expired keys. Commits and
    /// publishes events only when `f` succeeds; otherwise everything rolls back.
    fn txn<T>(&self, op: &'static str, f: impl FnOnce(&Transaction<'_>, i64, &mut Vec<StoreEvent>) -> Result<T>) -> Result<T> {
        let started = Instant::now();
        let now = (self.clock)();
        let (res, evs) = {
            let mut db = self.lock()?;
            let tx = db.transaction().map_err(db_err)?;
            let mut evs = purge_expired(&tx, now)?;
            match f(&tx, now, &mut evs) {
                Ok(v) => {
                    tx.commit().map_err(db_err)?;
                    (Ok(v), evs)
                }
                Err(e) => (Err(e), Vec::new()),
            }
        };
        self.events.publish_all(evs);
        histogram!("persist_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
        res
    }
}

fn db_err(e: rusqlite::Error) -> Error { Error::Unavailable(anyhow::Error::new(e).context("sqlite")) }

fn bump(tx: &Transaction<'_>) -> Result<Version> {
    let rev: i64 = tx
        .query_row("UPDATE revision SET rev = rev + 1 WHERE id = 0 RETURNING rev", [], |r| r.get(0))
        .map_err(db_err)?;
    Ok(Version::new(rev as u64))
}

fn purge_expired(tx: &Transaction<'_>, now: i64) -> Result<Vec<StoreEvent>> {
    let expired: Vec<(String, Vec<u8>)> = {
        let mut stmt = tx
            .prepare("SELECT key, value FROM kv WHERE expires_at IS NOT NULL AND expires_at <= ?1 ORDER BY key")
            .map_err(db_err)?;
        let rows = stmt
            .query_map([now], |r| Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?)))
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<_>>().map_err(db_err)?
    };
    let mut out = Vec::with_capacity(expired.len());
    for (key, blob) in expired {
        tx.execute("DELETE FROM kv WHERE key = ?1", [&key]).map_err(db_err)?;
        let version = bump(tx)?;
        debug!(key = %key, "ttl elapsed; key expired");
        out.push(StoreEvent { kind: EventKind::Expired, key, value: Some(maybe_decompress(&blob)), version });
    }
    if !out.is_empty() {
        counter!("store_ttl_expired_total", out.len() as u64);
    }
    Ok(out)
}

fn current_version(tx: &Transaction<'_>, key: &str) -> Result<Option<Version>> {
    let v: Option<i64> = tx
        .query_row("SELECT version FROM kv WHERE key = ?1", [key], |r| r.get(0))
        .optional()
        .map_err(db_err)?;
    Ok(v.map(|v| Version::new(v as u64)))
}

fn expires_at(now: i64, ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|d| now.saturating_add(d.as_millis().min(i64::MAX as u128) as i64))
}

fn to_entry(key: String, blob: Vec<u8>, version: i64, expires_at: Option<i64>, now: i64) -> Entry {
    Entry {
        key,
        value: maybe_decompress(&blob),
        version: Version::new(version as u64),
        ttl: expires_at.map(|at| Duration::from_millis(at.saturating_sub(now).max(0) as u64)),
    }
}

#[async_trait::async_trait]
impl VersionedStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Entry> {
        self.txn("get", |tx, now, _| {
            let row = tx
                .query_row("SELECT value, version, expires_at FROM kv WHERE key = ?1", [key], |r| {
                    Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, i64>(1)?, r.get::<_, Option<i64>>(2)?))
                })
                .optional()
                .map_err(db_err)?;
            let (blob, version, exp) = row.ok_or_else(|| Error::not_found(key))?;
            Ok(to_entry(key.to_string(), blob, version, exp, now))
        })
    }

    async fn create_if_absent(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<Version> {
        check_ttl(ttl)?;
        let res = self.txn("create", |tx, now, evs| {
            if current_version(tx, key)?.is_some() {
                return Err(Error::already_exists(key));
            }
            let version = bump(tx)?;
            tx.execute(
                "INSERT INTO kv(key, value, version, expires_at) VALUES (?1, ?2, ?3, ?4)",
                params![key, maybe_compress(&value), version.get() as i64, expires_at(now, ttl)],
            )
            .map_err(db_err)?;
            evs.push(StoreEvent { kind: EventKind::Created, key: key.to_string(), value: Some(value), version });
            Ok(version)
        });
        if res.is_ok() {
            counter!("persist_put_total", 1u64);
        }
        res
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Version,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<Version> {
        check_ttl(ttl)?;
        let res = self.txn("cas", |tx, now, evs| {
            let current = current_version(tx, key)?.ok_or_else(|| Error::not_found(key))?;
            if current != expected {
                return Err(Error::conflict(key, format!("expected version {}, found {}", expected, current)));
            }
            let version = bump(tx)?;
            tx.execute(
                "UPDATE kv SET value = ?2, version = ?3, expires_at = ?4 WHERE key = ?1",
                params![key, maybe_compress(&value), version.get() as i64, expires_at(now, ttl)],
            )
            .map_err(db_err)?;
            evs.push(StoreEvent { kind: EventKind::Updated, key: key.to_string(), value: Some(value), version });
            Ok(version)
        });
        if res.is_ok() {
            counter!("persist_put_total", 1u64);
        }
        res
    }

    async fn delete(&self, key: &str, expected: Option<Version>) -> Result<()> {
        self.txn("delete", |tx, _, evs| {
            let row = tx
                .query_row("SELECT value, version FROM kv WHERE key = ?1", [key], |r| {
                    Ok((r.get::<_, Vec<u8>>(0)?, r.get::<_, i64>(1)?))
                })
                .optional()
                .map_err(db_err)?;
            let (blob, current) = row.ok_or_else(|| Error::not_found(key))?;
            let current = Version::new(current as u64);
            if let Some(expected) = expected {
                if current != expected {
                    return Err(Error::conflict(key, format!("expected version {}, found {}", expected, current)));
                }
            }
            tx.execute("DELETE FROM kv WHERE key = ?1", [key]).map_err(db_err)?;
            let version = bump(tx)?;
            evs.push(StoreEvent { kind: EventKind::Deleted, key: key.to_string(), value: Some(maybe_decompress(&blob)), version });
            Ok(())
        })
    }

    async fn list(&self, prefix: &str) -> Result<EntryStream> {
        let entries = self.txn("list", |tx, now, _| {
            let mut stmt = tx
                .prepare(
                    "SELECT key, value, version, expires_at FROM kv
                     WHERE substr(key, 1, length(?1)) = ?1
                     ORDER BY key",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map([prefix], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, Vec<u8>>(1)?, r.get::<_, i64>(2)?, r.get::<_, Option<i64>>(3)?))
                })
                .map_err(db_err)?;
            let mut out = Vec::new();
            for row in rows {
                let (key, blob, version, exp) = row.map_err(db_err)?;
                out.push(to_entry(key, blob, version, exp, now));
            }
            Ok(out)
        })?;
        Ok(futures::stream::iter(entries.into_iter().map(Ok)).boxed())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream> {
        Ok(self.events.subscribe(prefix))
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".tessera");
        let _ = std::fs::create_dir_all(&p);
        p.push("tessera.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "tessera.db".to_string()
}

pub fn maybe_compress(raw: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("TESSERA_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(raw, lvl).unwrap_or_else(|_| raw.to_vec());
    }
    #[cfg(not(feature = "zstd"))]
    raw.to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return de;
        }
    }
    blob.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("tessera-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn manual_clock(start: i64) -> (Arc<AtomicI64>, Clock) {
        let t = Arc::new(AtomicI64::new(start));
        let c = Arc::clone(&t);
        (t, Arc::new(move || c.load(Ordering::SeqCst)))
    }

    #[tokio::test]
    async fn versions_survive_reopen() {
        let path = temp_db();
        let v1 = {
            let s = SqliteStore::open(&path).unwrap();
            s.create_if_absent("/r/ns/a", b"one".to_vec(), None).await.unwrap()
        };
        let s = SqliteStore::open(&path).unwrap();
        let e = s.get("/r/ns/a").await.unwrap();
        assert_eq!(e.value, b"one");
        assert_eq!(e.version, v1);
        let v2 = s.create_if_absent("/r/ns/b", b"two".to_vec(), None).await.unwrap();
        assert!(v2 > v1);
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn cas_and_delete_guard_versions() {
        let s = SqliteStore::open_in_memory().unwrap();
        let v1 = s.create_if_absent("/a", vec![1], None).await.unwrap();
        assert!(s.create_if_absent("/a", vec![9], None).await.unwrap_err().is_already_exists());
        let v2 = s.compare_and_swap("/a", v1, vec![2], None).await.unwrap();
        assert!(s.compare_and_swap("/a", v1, vec![3], None).await.unwrap_err().is_conflict());
        assert!(s.delete("/a", Some(v1)).await.unwrap_err().is_conflict());
        s.delete("/a", Some(v2)).await.unwrap();
        assert!(s.get("/a").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_orders_by_key_within_prefix() {
        let s = SqliteStore::open_in_memory().unwrap();
        for k in ["/r/ns/c", "/r/ns2/a", "/r/ns/a", "/r/ns/b"] {
            s.create_if_absent(k, vec![0], None).await.unwrap();
        }
        let keys: Vec<String> = s.list("/r/ns/").await.unwrap().map_ok(|e| e.key).try_collect().await.unwrap();
        assert_eq!(keys, vec!["/r/ns/a", "/r/ns/b", "/r/ns/c"]);
    }

    #[tokio::test]
    async fn ttl_is_reported_and_enforced() {
        let (t, clock) = manual_clock(1_000_000);
        let s = SqliteStore::open_in_memory().unwrap().with_clock(clock);
        let v = s.create_if_absent("/a", vec![1], None).await.unwrap();
        s.compare_and_swap("/a", v, vec![2], Some(Duration::from_secs(30))).await.unwrap();
        assert_eq!(s.get("/a").await.unwrap().ttl_secs(), Some(30));

        t.fetch_add(29_500, Ordering::SeqCst);
        assert_eq!(s.get("/a").await.unwrap().ttl_secs(), Some(1));

        t.fetch_add(500, Ordering::SeqCst);
        assert!(s.get("/a").await.unwrap_err().is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_expires_keys_without_other_calls() {
        let (t, clock) = manual_clock(1_000_000);
        let s = Arc::new(SqliteStore::open_in_memory().unwrap().with_clock(clock));
        let sweeper = s.spawn_sweeper(Duration::from_secs(1));
        let mut w = s.watch("/r/").await.unwrap();
        s.create_if_absent("/r/a", vec![1], Some(Duration::from_secs(30))).await.unwrap();
        assert_eq!(w.recv().await.unwrap().kind, EventKind::Created);

        t.fetch_add(31_000, Ordering::SeqCst);
        let ev = tokio::time::timeout(Duration::from_secs(10), w.recv()).await.unwrap().unwrap();
        assert_eq!(ev.kind, EventKind::Expired);
        assert_eq!(ev.key, "/r/a");

        drop(w);
        drop(s);
        tokio::time::timeout(Duration::from_secs(10), sweeper).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_write_leaves_no_trace() {
        let s = SqliteStore::open_in_memory().unwrap();
        let v1 = s.create_if_absent("/a", vec![1], None).await.unwrap();
        let _ = s.compare_and_swap("/a", Version::new(v1.get() + 10), vec![2], None).await;
        let v2 = s.create_if_absent("/b", vec![1], None).await.unwrap();
        assert_eq!(v2, v1.next());
    }

    #[test]
    fn compression_round_trips() {
        let raw = br#"{"kind":"HorizontalPodAutoscaler"}"#;
        assert_eq!(maybe_decompress(&maybe_compress(raw)), raw.to_vec());
    }
}
