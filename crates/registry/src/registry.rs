use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::SubsecRound;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::Resource;
use metrics::{counter, histogram};
use tessera_core::{Error, KeyBuilder, Result, StorageKey, Version};
use tessera_store::{Entry, EventKind, VersionedStore};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{Codec, JsonCodec};
use crate::config::RegistryConfig;
use crate::selector::LabelSelector;
use crate::RequestContext;

/// Compile-time scope of a kind, used to pick the key layout.
pub trait KindScope {
    const NAMESPACED: bool;
}

impl KindScope for k8s_openapi::NamespaceResourceScope {
    const NAMESPACED: bool = true;
}

impl KindScope for k8s_openapi::ClusterResourceScope {
    const NAMESPACED: bool = false;
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub label_selector: Option<LabelSelector>,
}

impl ListOptions {
    /// Options filtering by a label selector expression.
    pub fn labels(expr: &str) -> Result<Self> {
        Ok(Self { label_selector: Some(expr.parse()?) })
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// `None` uses the configured default grace period.
    pub grace_period: Option<Duration>,
    /// Version the object must still be at.
    pub precondition: Option<Version>,
}

/// Result of a delete that may be graceful.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome<K> {
    /// The key is gone.
    Deleted,
    /// The object is marked for deletion and expires with its grace period.
    Terminating(K),
}

impl<K> DeleteOutcome<K> {
    pub fn is_deleted(&self) -> bool { matches!(self, DeleteOutcome::Deleted) }

    pub fn terminating(self) -> Option<K> {
        match self {
            DeleteOutcome::Terminating(k) => Some(k),
            DeleteOutcome::Deleted => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    /// Removed by a delete or by grace-period expiry; carries the last state.
    Deleted(K),
}

/// Typed change stream for one registry scope.
pub struct WatchHandle<K> {
    rx: mpsc::Receiver<WatchEvent<K>>,
    cancel: CancellationToken,
}

impl<K> WatchHandle<K> {
    pub async fn recv(&mut self) -> Option<WatchEvent<K>> { self.rx.recv().await }

    pub fn cancel(&self) { self.cancel.cancel(); }
}

impl<K> Drop for WatchHandle<K> {
    fn drop(&mut self) { self.cancel.cancel(); }
}

/// Generic CRUD storage for one resource kind.
///
/// Holds no per-object state; every call is a fresh round trip to the store,
/// and correctness under concurrency rests entirely on the store's
/// compare-and-swap.
pub struct Registry<K, C = JsonCodec> {
    store: Arc<dyn VersionedStore>,
    keys: KeyBuilder,
    codec: C,
    config: RegistryConfig,
    _kind: PhantomData<fn() -> K>,
}

impl<K, C: Clone> Clone for Registry<K, C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            keys: self.keys.clone(),
            codec: self.codec.clone(),
            config: self.config.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K, C> Registry<K, C>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
    C: Codec<K> + Clone + 'static,
{
    pub fn new(store: Arc<dyn VersionedStore>, keys: KeyBuilder, codec: C, config: RegistryConfig) -> Self {
        Self { store, keys, codec, config, _kind: PhantomData }
    }

    /// Registry keyed under `<key_root>/<plural>` with the kind's own scope.
    pub fn for_kind(store: Arc<dyn VersionedStore>, codec: C, config: RegistryConfig) -> Self
    where
        K::Scope: KindScope,
    {
        let plural = K::plural(&());
        let keys = if <K::Scope as KindScope>::NAMESPACED {
            KeyBuilder::namespaced(&config.key_root, &plural)
        } else {
            KeyBuilder::cluster(&config.key_root, &plural)
        };
        Self::new(store, keys, codec, config)
    }

    pub fn keys(&self) -> &KeyBuilder { &self.keys }

    /// Storage key for `name` in the context's namespace.
    pub fn key_for(&self, ctx: &RequestContext, name: &str) -> Result<StorageKey> {
        self.keys.key_for(self.scoped_ns(ctx), name).map_err(as_invalid_input)
    }

    pub async fn create(&self, ctx: &RequestContext, mut obj: K) -> Result<K> {
        let started = Instant::now();
        self.prepare_create(ctx, &mut obj)?;
        let key = self.keys.key_for(namespace_of(&obj), name_of(&obj)).map_err(as_invalid_input)?;
        let bytes = self.encode(&key, &obj)?;
        ctx.check()?;
        let version = self.store.create_if_absent(key.as_str(), bytes, None).await?;
        set_version(&mut obj, version);
        info!(key = %key, version = %version, "registry: created");
        counter!("registry_create_total", 1u64);
        histogram!("registry_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "create");
        Ok(obj)
    }

    pub async fn get(&self, ctx: &RequestContext, name: &str) -> Result<K> {
        let key = self.key_for(ctx, name)?;
        ctx.check()?;
        let entry = self.store.get(key.as_str()).await?;
        counter!("registry_get_total", 1u64);
        self.decode(&entry)
    }

    /// Objects in the context's namespace (all namespaces when it has none),
    /// in store key order. Entries that fail to decode are skipped.
    pub async fn list(&self, ctx: &RequestContext, opts: &ListOptions) -> Result<Vec<K>> {
        let started = Instant::now();
        let prefix = self.keys.prefix_for(self.scoped_ns(ctx)).map_err(as_invalid_input)?;
        ctx.check()?;
        let mut entries = self.store.list(prefix.as_str()).await?;
        let mut out = Vec::new();
        let mut skipped = 0usize;
        while let Some(entry) = entries.next().await {
            ctx.check()?;
            let entry = entry?;
            let obj = match self.decode(&entry) {
                Ok(obj) => obj,
                Err(e) => {
                    warn!(key = %entry.key, error = %e, "registry: skipping undecodable entry");
                    skipped += 1;
                    continue;
                }
            };
            let keep = opts.label_selector.as_ref().map(|s| s.matches(obj.meta().labels.as_ref())).unwrap_or(true);
            if keep {
                out.push(obj);
            }
        }
        if skipped > 0 {
            counter!("registry_list_skipped", skipped as u64);
        }
        counter!("registry_list_total", 1u64);
        debug!(prefix = %prefix, items = out.len(), skipped, took_ms = %started.elapsed().as_millis(), "registry: list");
        Ok(out)
    }

    /// Read-modify-write `name` with `transform`, retrying on conflicts.
    ///
    /// `transform` may run several times and must not have side effects; it
    /// may refuse (e.g. for terminating objects) by returning an error.
    pub async fn update<F>(&self, ctx: &RequestContext, name: &str, transform: F) -> Result<K>
    where
        F: Fn(K) -> Result<K> + Send + Sync,
    {
        let started = Instant::now();
        let key = self.key_for(ctx, name)?;
        let f = &transform;
        let key_ref = &key;
        let obj = self
            .config
            .retry
            .run(ctx, key.as_str(), move |attempt| self.update_once(ctx, key_ref, attempt, None, f))
            .await?;
        counter!("registry_update_total", 1u64);
        histogram!("registry_op_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => "update");
        Ok(obj)
    }

    /// Overwrite the stored object with `obj`. A `resourceVersion` on `obj` is
    /// a precondition (one attempt, stale means `Conflict`); without one the
    /// write is retried like `update`.
    pub async fn replace(&self, ctx: &RequestContext, mut obj: K) -> Result<K> {
        if self.keys.is_namespaced() && namespace_of(&obj).is_none() {
            obj.meta_mut().namespace = ctx.namespace().map(str::to_string);
        }
        let precondition = match obj.meta().resource_version.as_deref().filter(|s| !s.is_empty()) {
            Some(rv) => Some(rv.parse::<Version>()?),
            None => None,
        };
        let name = name_of(&obj).to_string();
        if name.is_empty() {
            return Err(Error::InvalidInput("metadata.name is required".into()));
        }
        if let (Some(want), Some(got)) = (self.scoped_ns(ctx), namespace_of(&obj)) {
            if want != got {
                return Err(Error::InvalidInput(format!(
                    "namespace {} does not match request namespace {}",
                    got, want
                )));
            }
        }
        let key = self.keys.key_for(namespace_of(&obj), &name).map_err(as_invalid_input)?;
        // Deletion state belongs to the store side and is carried over.
        let f = move |current: K| -> Result<K> {
            let mut next = obj.clone();
            next.meta_mut().deletion_timestamp = current.meta().deletion_timestamp.clone();
            next.meta_mut().deletion_grace_period_seconds = current.meta().deletion_grace_period_seconds;
            Ok(next)
        };
        let out = match precondition {
            Some(v) => self.update_once(ctx, &key, 1, Some(v), &f).await?,
            None => {
                let key_ref = &key;
                let f = &f;
                self.config.retry.run(ctx, key.as_str(), move |attempt| self.update_once(ctx, key_ref, attempt, None, f)).await?
            }
        };
        counter!("registry_update_total", 1u64);
        Ok(out)
    }

    /// Remove `name` now, optionally only if still at `expected`.
    pub async fn delete(&self, ctx: &RequestContext, name: &str, expected: Option<Version>) -> Result<()> {
        let key = self.key_for(ctx, name)?;
        ctx.check()?;
        self.store.delete(key.as_str(), expected).await?;
        info!(key = %key, "registry: deleted");
        counter!("registry_delete_total", 1u64);
        Ok(())
    }

    /// Mark `name` for deletion and let the store expire it after `grace`.
    /// A zero grace deletes immediately.
    pub async fn graceful_delete(&self, ctx: &RequestContext, name: &str, grace: Duration) -> Result<DeleteOutcome<K>> {
        self.delete_with(ctx, name, &DeleteOptions { grace_period: Some(grace), precondition: None }).await
    }

    pub async fn delete_with(&self, ctx: &RequestContext, name: &str, opts: &DeleteOptions) -> Result<DeleteOutcome<K>> {
        let grace = opts.grace_period.unwrap_or_else(|| self.config.default_grace());
        if grace.is_zero() {
            self.delete(ctx, name, opts.precondition).await?;
            return Ok(DeleteOutcome::Deleted);
        }
        let key = self.key_for(ctx, name)?;
        let out = match opts.precondition {
            Some(v) => self.mark_terminating_once(ctx, &key, grace, Some(v)).await?,
            None => {
                let key_ref = &key;
                self.config.retry.run(ctx, key.as_str(), move |_| self.mark_terminating_once(ctx, key_ref, grace, None)).await?
            }
        };
        counter!("registry_graceful_delete_total", 1u64);
        Ok(DeleteOutcome::Terminating(out))
    }

    /// Stream changes in the context's namespace (all namespaces when it has
    /// none). The stream ends when the context is cancelled.
    pub async fn watch(&self, ctx: &RequestContext) -> Result<WatchHandle<K>> {
        let prefix = self.keys.prefix_for(self.scoped_ns(ctx)).map_err(as_invalid_input)?;
        ctx.check()?;
        let mut events = self.store.watch(prefix.as_str()).await?;
        let (tx, rx) = mpsc::channel::<WatchEvent<K>>(256);
        let cancel = ctx.token().child_token();
        let token = cancel.clone();
        let codec = self.codec.clone();
        tokio::spawn(async move {
            loop {
                let ev = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    ev = events.recv() => match ev { Some(ev) => ev, None => break },
                };
                let Some(bytes) = ev.value.as_deref() else { continue };
                let mut obj = match codec.decode(bytes) {
                    Ok(obj) => obj,
                    Err(e) => {
                        warn!(key = %ev.key, error = %e, "registry: skipping undecodable watch event");
                        continue;
                    }
                };
                set_version(&mut obj, ev.version);
                let out = match ev.kind {
                    EventKind::Created => WatchEvent::Added(obj),
                    EventKind::Updated => WatchEvent::Modified(obj),
                    EventKind::Deleted | EventKind::Expired => WatchEvent::Deleted(obj),
                };
                if tx.send(out).await.is_err() {
                    break;
                }
            }
            debug!(prefix = %prefix, "registry: watch stopped");
        });
        Ok(WatchHandle { rx, cancel })
    }

    async fn update_once<F>(
        &self,
        ctx: &RequestContext,
        key: &StorageKey,
        attempt: u32,
        precondition: Option<Version>,
        transform: &F,
    ) -> Result<K>
    where
        F: Fn(K) -> Result<K> + Send + Sync,
    {
        ctx.check()?;
        let entry = self.store.get(key.as_str()).await?;
        if let Some(want) = precondition {
            if want != entry.version {
                return Err(Error::conflict(key.as_str(), format!("expected version {}, found {}", want, entry.version)));
            }
        }
        let current = self.decode(&entry)?;
        let mut next = transform(current.clone())?;
        check_identity(&current, &next)?;
        let bytes = self.encode(key, &next)?;
        ctx.check()?;
        // Keep any running grace period: an update never extends or clears it.
        let ttl = entry.ttl.map(|d| d.max(Duration::from_millis(1)));
        let version = self.store.compare_and_swap(key.as_str(), entry.version, bytes, ttl).await?;
        set_version(&mut next, version);
        debug!(key = %key, attempt, from = %entry.version, to = %version, "registry: updated");
        Ok(next)
    }

    async fn mark_terminating_once(
        &self,
        ctx: &RequestContext,
        key: &StorageKey,
        grace: Duration,
        precondition: Option<Version>,
    ) -> Result<K> {
        ctx.check()?;
        let entry = self.store.get(key.as_str()).await?;
        if let Some(want) = precondition {
            if want != entry.version {
                return Err(Error::conflict(key.as_str(), format!("expected version {}, found {}", want, entry.version)));
            }
        }
        let mut obj = self.decode(&entry)?;
        if obj.meta().deletion_timestamp.is_some() {
            if let Some(remaining) = entry.ttl {
                if grace >= remaining {
                    debug!(key = %key, "registry: already terminating within grace");
                    return Ok(obj);
                }
            }
        }
        let meta = obj.meta_mut();
        if meta.deletion_timestamp.is_none() {
            // Timestamps are stored with whole-second precision.
            meta.deletion_timestamp = Some(Time(chrono::Utc::now().trunc_subsecs(0)));
        }
        meta.deletion_grace_period_seconds = Some(ceil_secs(grace));
        let bytes = self.encode(key, &obj)?;
        ctx.check()?;
        let version = self.store.compare_and_swap(key.as_str(), entry.version, bytes, Some(grace)).await?;
        set_version(&mut obj, version);
        info!(key = %key, grace_secs = ceil_secs(grace), "registry: marked for deletion");
        Ok(obj)
    }

    /// Namespace from the context, ignored for cluster-scoped kinds.
    fn scoped_ns<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        if self.keys.is_namespaced() { ctx.namespace() } else { None }
    }

    fn prepare_create(&self, ctx: &RequestContext, obj: &mut K) -> Result<()> {
        let namespaced = self.keys.is_namespaced();
        let meta = obj.meta_mut();
        if meta.resource_version.as_deref().is_some_and(|s| !s.is_empty()) {
            return Err(Error::InvalidInput("metadata.resourceVersion may not be set on create".into()));
        }
        if meta.deletion_timestamp.is_some() {
            return Err(Error::InvalidInput("metadata.deletionTimestamp may not be set on create".into()));
        }
        let obj_ns = meta.namespace.clone().filter(|s| !s.is_empty());
        if namespaced {
            match (obj_ns.as_deref(), ctx.namespace()) {
                (Some(got), Some(want)) if got != want => {
                    return Err(Error::InvalidInput(format!(
                        "namespace {} does not match request namespace {}",
                        got, want
                    )));
                }
                (Some(_), _) => {}
                (None, Some(want)) => meta.namespace = Some(want.to_string()),
                (None, None) => return Err(Error::InvalidInput("metadata.namespace is required".into())),
            }
        } else if let Some(ns) = obj_ns {
            return Err(Error::InvalidInput(format!("cluster-scoped object may not set namespace {}", ns)));
        }
        if meta.name.as_deref().unwrap_or("").is_empty() {
            match meta.generate_name.as_deref().filter(|s| !s.is_empty()) {
                Some(base) => meta.name = Some(format!("{}{}", base, random_suffix())),
                None => return Err(Error::InvalidInput("metadata.name or metadata.generateName is required".into())),
            }
        }
        Ok(())
    }

    fn encode(&self, key: &StorageKey, obj: &K) -> Result<Vec<u8>> {
        // The version lives in the store, never in the stored body.
        let mut stored = obj.clone();
        stored.meta_mut().resource_version = None;
        self.codec
            .encode(&stored)
            .map_err(|source| Error::Codec { key: key.to_string(), source })
    }

    fn decode(&self, entry: &Entry) -> Result<K> {
        let mut obj = self
            .codec
            .decode(&entry.value)
            .map_err(|source| Error::Codec { key: entry.key.clone(), source })?;
        set_version(&mut obj, entry.version);
        Ok(obj)
    }
}

fn name_of<K: Resource>(obj: &K) -> &str { obj.meta().name.as_deref().unwrap_or("") }

fn namespace_of<K: Resource>(obj: &K) -> Option<&str> { obj.meta().namespace.as_deref().filter(|s| !s.is_empty()) }

fn set_version<K: Resource>(obj: &mut K, version: Version) {
    obj.meta_mut().resource_version = Some(version.to_string());
}

fn check_identity<K: Resource>(current: &K, next: &K) -> Result<()> {
    if name_of(current) != name_of(next) {
        return Err(Error::immutable("metadata.name"));
    }
    if namespace_of(current) != namespace_of(next) {
        return Err(Error::immutable("metadata.namespace"));
    }
    if current.meta().deletion_timestamp != next.meta().deletion_timestamp {
        return Err(Error::immutable("metadata.deletionTimestamp"));
    }
    Ok(())
}

fn as_invalid_input(e: Error) -> Error {
    match e {
        Error::InvalidKey(msg) => Error::InvalidInput(msg),
        other => other,
    }
}

fn ceil_secs(d: Duration) -> i64 {
    let secs = d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0));
    i64::try_from(secs).unwrap_or(i64::MAX)
}

fn random_suffix() -> String {
    let mut s = uuid::Uuid::new_v4().simple().to_string();
    s.truncate(5);
    s
}
