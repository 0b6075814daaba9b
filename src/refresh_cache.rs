//! Refresh-ahead read-through cache
//!
//! [`RefreshCache`] sits in front of a shared key-value store and handles the
//! two classic read-through problems:
//! - Stampedes: on a miss only the holder of the per-key load lock runs the
//!   loader, everyone else backs off and re-reads.
//! - Reactive expiry: a read that finds an entry inside its namespace's
//!   preload window hands a refresh job to the background runner, which
//!   replays the registered loader under a second, independent lock.
//!
//! The load lock is named after the cache key, the refresh lock after the
//! cache key plus [`REFRESH_LOCK_SUFFIX`]. They never block each other; a
//! refresh and a cold load racing on one key both write fresh data and the
//! last write wins.

use std::fmt::Display;
use std::sync::Arc;

use serde::{Serialize, de::DeserializeOwned};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::registry::{CachedInvocation, InvocationDescriptor, InvocationKey, erase};
use crate::{
    CacheConfig, CacheError, CacheStore, CacheTime, DistributedLock, InvocationRegistry, Loader,
    NamespaceBackend, NamespaceCache, RedisStore, StoredEntry, TaskRunner,
};

/// Suffix appended to a cache key to name its refresh lock.
pub const REFRESH_LOCK_SUFFIX: &str = "_lock";

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Trait for cache key types
pub trait CacheKey: Display + Send + Sync {}
impl<T> CacheKey for T where T: Display + Send + Sync + ?Sized {}

/// Trait for generating store keys
pub trait KeyFormatter: Send + Sync + 'static {
    /// Build the store key for `key` in `namespace`
    fn format_key(&self, namespace: &str, key: &str) -> String;

    /// Name of the refresh lock for a store key
    fn refresh_lock_name(&self, store_key: &str) -> String {
        format!("{store_key}{REFRESH_LOCK_SUFFIX}")
    }
}

/// Formats keys as `{prefix}{namespace}:{key}`.
#[derive(Debug, Clone)]
pub struct PrefixKeyFormatter {
    prefix: String,
}

impl PrefixKeyFormatter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl KeyFormatter for PrefixKeyFormatter {
    fn format_key(&self, namespace: &str, key: &str) -> String {
        format!("{}{}:{}", self.prefix, namespace, key)
    }
}

/// Result of [`RefreshCache::get_or_load`].
#[derive(Debug)]
pub enum LoadOutcome<V> {
    /// Served from the store.
    Hit(V),
    /// Produced by the loader and written to the store.
    Loaded(V),
    /// The loader reported no value, now or through a cached absent marker.
    NotFound,
    /// The loader failed or timed out. Nothing was written.
    LoadFailed(CacheError),
    /// Another caller kept the load lock for the whole retry budget.
    ContentionTimeout { attempts: u32 },
    /// The store failed while taking the load lock. The loader did not run.
    StoreUnavailable(CacheError),
}

impl<V> LoadOutcome<V> {
    pub fn value(&self) -> Option<&V> {
        match self {
            Self::Hit(v) | Self::Loaded(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_value(self) -> Option<V> {
        match self {
            Self::Hit(v) | Self::Loaded(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded(_))
    }

    /// Convert into a `Result`, turning failures into errors.
    pub fn into_result(self) -> Result<Option<V>, CacheError> {
        match self {
            Self::Hit(v) | Self::Loaded(v) => Ok(Some(v)),
            Self::NotFound => Ok(None),
            Self::LoadFailed(e) => Err(e),
            Self::StoreUnavailable(e) => Err(e),
            Self::ContentionTimeout { attempts } => Err(CacheError::Contention { attempts }),
        }
    }
}

/// What a single store read found.
enum Lookup<V> {
    Present(V),
    Absent,
    /// Empty payload, observed while another writer is mid-write.
    Placeholder,
    Miss,
}

/// Refresh-ahead cache over a shared store.
///
/// Cheap to clone; clones share the store, registry and refresh workers.
#[derive(Clone)]
pub struct RefreshCache {
    inner: Arc<RefreshCacheInner>,
}

struct RefreshCacheInner {
    store: Arc<dyn CacheStore>,
    registry: InvocationRegistry,
    runner: TaskRunner,
    config: CacheConfig,
    key_formatter: Arc<dyn KeyFormatter>,
}

impl RefreshCache {
    /// Create a cache over `store`. Must be called inside a tokio runtime,
    /// since the refresh workers are spawned here.
    pub fn new(store: Arc<dyn CacheStore>, config: CacheConfig) -> Self {
        let key_formatter = PrefixKeyFormatter::new(config.key_prefix.clone());
        Self::with_key_formatter(store, config, key_formatter)
    }

    /// Create a cache backed by Redis.
    pub async fn with_redis(
        redis_client: redis::Client,
        config: CacheConfig,
    ) -> Result<Self, redis::RedisError> {
        let store = RedisStore::new(redis_client).await?;
        Ok(Self::new(Arc::new(store), config))
    }

    pub fn with_key_formatter(
        store: Arc<dyn CacheStore>,
        config: CacheConfig,
        key_formatter: impl KeyFormatter,
    ) -> Self {
        for (namespace, time) in &config.namespaces {
            if !time.is_well_formed() {
                warn!(
                    "Cache namespace {} has preload {}s >= expiration {}s; every read will check for refresh",
                    namespace,
                    time.preload_secs(),
                    time.expiration_secs()
                );
            }
        }

        let runner = TaskRunner::new(config.refresh_workers, config.refresh_queue_capacity);

        Self {
            inner: Arc::new(RefreshCacheInner {
                store,
                registry: InvocationRegistry::with_time_to_idle(config.registration_idle()),
                runner,
                config,
                key_formatter: Arc::new(key_formatter),
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &InvocationRegistry {
        &self.inner.registry
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.inner.store
    }

    /// Typed cache bound to one namespace and its backend.
    pub fn namespace<V, B>(&self, namespace: impl Into<String>, backend: B) -> NamespaceCache<V, B>
    where
        V: Cacheable,
        B: NamespaceBackend<V>,
    {
        NamespaceCache::new(self.clone(), namespace, backend)
    }

    /// Store key for `key` in `namespace`.
    pub fn store_key<K: CacheKey + ?Sized>(&self, namespace: &str, key: &K) -> String {
        self.inner
            .key_formatter
            .format_key(namespace, &key.to_string())
    }

    /// Get a value, scheduling a background refresh when it is close to
    /// expiry. Store errors are logged and read as a miss.
    ///
    /// The only foreground cost of refresh-ahead is one TTL query; the
    /// refresh itself runs on the background workers.
    pub async fn get<K, V>(&self, namespace: &str, key: &K) -> Option<V>
    where
        K: CacheKey + ?Sized,
        V: Cacheable,
    {
        let store_key = self.store_key(namespace, key);
        let time = self.inner.config.time_for(namespace);

        match self.lookup::<V>(&store_key).await {
            Lookup::Present(value) => {
                debug!("Cache hit for key: {}", store_key);
                self.maybe_schedule_refresh(namespace, &store_key, time)
                    .await;
                Some(value)
            }
            Lookup::Absent => {
                debug!("Cached absence for key: {}", store_key);
                None
            }
            Lookup::Placeholder | Lookup::Miss => {
                debug!("Cache miss for key: {}", store_key);
                None
            }
        }
    }

    /// Get a value or load it, with at most one loader running per key
    /// across every process sharing the store.
    ///
    /// The loader is also registered for the key, so later refreshes can
    /// replay it.
    pub async fn get_or_load<K, V, L>(&self, namespace: &str, key: &K, loader: L) -> LoadOutcome<V>
    where
        K: CacheKey + ?Sized,
        V: Cacheable,
        L: Loader<V>,
    {
        let store_key = self.store_key(namespace, key);
        let time = self.inner.config.time_for(namespace);
        let config = &self.inner.config;

        let loader = Arc::new(loader);
        self.inner.registry.register(CachedInvocation::new(
            InvocationKey::new(namespace, store_key.as_str()),
            InvocationDescriptor::new("get_or_load", std::any::type_name::<L>()),
            erase::<V, L>(Arc::clone(&loader)),
        ));

        let started = Instant::now();
        let mut attempts = 0u32;
        let mut placeholder_retried = false;

        loop {
            attempts += 1;

            match self.lookup::<V>(&store_key).await {
                Lookup::Present(value) => {
                    debug!("Cache hit for key: {}", store_key);
                    self.maybe_schedule_refresh(namespace, &store_key, time)
                        .await;
                    return LoadOutcome::Hit(value);
                }
                // absent markers are short-lived and simply reload on expiry
                Lookup::Absent => return LoadOutcome::NotFound,
                Lookup::Placeholder if !placeholder_retried => {
                    debug!("Empty placeholder for key {}, re-reading once", store_key);
                    placeholder_retried = true;
                    continue;
                }
                Lookup::Placeholder | Lookup::Miss => {}
            }

            let mut lock = DistributedLock::new(
                Arc::clone(&self.inner.store),
                store_key.as_str(),
                config.lock_lease,
            );
            match lock.try_lock().await {
                Ok(true) => {
                    let outcome = self.load_locked(&store_key, time, loader.as_ref()).await;
                    lock.unlock().await;
                    return outcome;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "Store error taking load lock for key {} ({}). Not loading.",
                        store_key, e
                    );
                    return LoadOutcome::StoreUnavailable(e);
                }
            }

            if attempts >= config.max_load_attempts
                || started.elapsed() + config.retry_backoff > config.contention_deadline
            {
                warn!(
                    "Gave up loading key {} after {} attempts under lock contention",
                    store_key, attempts
                );
                return LoadOutcome::ContentionTimeout { attempts };
            }

            debug!(
                "Load lock for key {} is held elsewhere, retrying in {:?}",
                store_key, config.retry_backoff
            );
            tokio::time::sleep(config.retry_backoff).await;
        }
    }

    /// Register how to recompute `key` in `namespace`. Replaces any earlier
    /// registration for the same key.
    pub fn register_invocation<K, V, L>(
        &self,
        namespace: &str,
        key: &K,
        descriptor: InvocationDescriptor,
        loader: L,
    ) where
        K: CacheKey + ?Sized,
        V: Cacheable,
        L: Loader<V>,
    {
        let store_key = self.store_key(namespace, key);
        debug!(
            "Registering {}::{} for key {}",
            descriptor.target, descriptor.method, store_key
        );
        self.inner.registry.register(CachedInvocation::new(
            InvocationKey::new(namespace, store_key),
            descriptor,
            erase::<V, L>(Arc::new(loader)),
        ));
    }

    /// Replay the registered loader for `key` and store the fresh value.
    ///
    /// Returns `Ok(false)` when nothing is registered for the key; such an
    /// entry simply cannot refresh itself.
    pub async fn refresh_cache_by_key<K>(&self, namespace: &str, key: &K) -> Result<bool, CacheError>
    where
        K: CacheKey + ?Sized,
    {
        let store_key = self.store_key(namespace, key);
        let time = self.inner.config.time_for(namespace);
        self.refresh_store_key(namespace, &store_key, time).await
    }

    /// Remove the entry from the store and forget its registered loader.
    pub async fn delete_cache_by_key<K>(&self, namespace: &str, key: &K) -> Result<(), CacheError>
    where
        K: CacheKey + ?Sized,
    {
        let store_key = self.store_key(namespace, key);
        debug!("Deleting cache entry for key: {}", store_key);

        self.inner.registry.remove(namespace, &store_key);
        self.inner.store.del(&store_key).await
    }

    /// Whether the store holds an entry for `key`, absent markers included.
    pub async fn contains<K>(&self, namespace: &str, key: &K) -> Result<bool, CacheError>
    where
        K: CacheKey + ?Sized,
    {
        let store_key = self.store_key(namespace, key);
        self.inner.store.exists(&store_key).await
    }

    async fn lookup<V: Cacheable>(&self, store_key: &str) -> Lookup<V> {
        let payload = match self.inner.store.get(store_key).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    "Store GET error for key {} ({}). Treating as miss.",
                    store_key, e
                );
                return Lookup::Miss;
            }
        };

        let Some(payload) = payload else {
            return Lookup::Miss;
        };
        if payload.is_empty() {
            return Lookup::Placeholder;
        }

        let decoded = StoredEntry::decode(&payload).and_then(|entry| match entry {
            StoredEntry::Present(json) => Ok(Lookup::Present(serde_json::from_value(json)?)),
            StoredEntry::Absent => Ok(Lookup::Absent),
        });

        match decoded {
            Ok(lookup) => lookup,
            Err(e) => {
                warn!(
                    "Failed to deserialize cached value for key {}: {}. Deleting corrupt entry.",
                    store_key, e
                );
                if let Err(del_err) = self.inner.store.del(store_key).await {
                    warn!(
                        "Failed to delete corrupt entry for key {}: {}",
                        store_key, del_err
                    );
                }
                Lookup::Miss
            }
        }
    }

    /// Runs with the load lock held.
    async fn load_locked<V, L>(&self, store_key: &str, time: CacheTime, loader: &L) -> LoadOutcome<V>
    where
        V: Cacheable,
        L: Loader<V>,
    {
        // Another process may have filled the entry while we waited.
        match self.lookup::<V>(store_key).await {
            Lookup::Present(value) => {
                debug!("Key {} was populated while acquiring the lock", store_key);
                return LoadOutcome::Hit(value);
            }
            Lookup::Absent => return LoadOutcome::NotFound,
            Lookup::Placeholder | Lookup::Miss => {}
        }

        let timeout = self.inner.config.effective_load_timeout();
        let loaded = match tokio::time::timeout(timeout, loader.load()).await {
            Ok(Ok(loaded)) => loaded,
            Ok(Err(e)) => {
                error!("Loader error for key {}: {}", store_key, e);
                return LoadOutcome::LoadFailed(CacheError::Loader(e));
            }
            Err(_) => {
                error!("Loader for key {} timed out after {:?}", store_key, timeout);
                return LoadOutcome::LoadFailed(CacheError::LoadTimeout(timeout));
            }
        };

        match loaded {
            Some(value) => {
                debug!("Loaded value for key: {}", store_key);
                let written = match serde_json::to_value(&value) {
                    Ok(json) => self.write_entry(store_key, Some(json), time).await,
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = written {
                    warn!(
                        "Failed to store loaded value for key {}: {}. Continuing.",
                        store_key, e
                    );
                }
                LoadOutcome::Loaded(value)
            }
            None => {
                debug!("Loader found no value for key: {}", store_key);
                if let Err(e) = self.write_entry(store_key, None, time).await {
                    warn!(
                        "Failed to store absent marker for key {}: {}. Continuing.",
                        store_key, e
                    );
                }
                LoadOutcome::NotFound
            }
        }
    }

    /// Write a fresh value, or the absent marker for `None`.
    async fn write_entry(
        &self,
        store_key: &str,
        value: Option<serde_json::Value>,
        time: CacheTime,
    ) -> Result<(), CacheError> {
        let store = &self.inner.store;
        match value {
            Some(json) => {
                let payload = StoredEntry::Present(json).encode()?;
                store
                    .set_ex(store_key, payload, time.expiration_secs())
                    .await
            }
            None => {
                let absent_ttl = self.inner.config.absent_ttl.as_secs();
                if absent_ttl == 0 {
                    store.del(store_key).await
                } else {
                    let payload = StoredEntry::Absent.encode()?;
                    store.set_ex(store_key, payload, absent_ttl).await
                }
            }
        }
    }

    async fn refresh_store_key(
        &self,
        namespace: &str,
        store_key: &str,
        time: CacheTime,
    ) -> Result<bool, CacheError> {
        let Some(invocation) = self.inner.registry.lookup(namespace, store_key) else {
            debug!("No invocation registered for key {}; nothing to refresh", store_key);
            return Ok(false);
        };

        let timeout = self.inner.config.effective_load_timeout();
        let replayed = tokio::time::timeout(timeout, invocation.replay())
            .await
            .map_err(|_| CacheError::LoadTimeout(timeout))??;

        // deleted while the replay ran
        if !self.inner.registry.contains(namespace, store_key) {
            debug!("Key {} was deleted during refresh; discarding result", store_key);
            return Ok(false);
        }

        self.write_entry(store_key, replayed, time).await?;
        debug!("Refreshed key {} via {:?}", store_key, invocation);
        Ok(true)
    }

    /// Submit a refresh job when the entry is inside its preload window.
    /// Returns whether a job was queued.
    async fn maybe_schedule_refresh(&self, namespace: &str, store_key: &str, time: CacheTime) -> bool {
        if !time.refresh_enabled() {
            return false;
        }

        let ttl = match self.inner.store.ttl(store_key).await {
            Ok(Some(ttl)) => ttl,
            Ok(None) => return false,
            Err(e) => {
                warn!("Store TTL error for key {}: {}. Skipping refresh.", store_key, e);
                return false;
            }
        };

        debug!(
            "ttl: {}, key: {}, preload: {}",
            ttl,
            store_key,
            time.preload_secs()
        );
        if !time.needs_refresh(ttl) {
            return false;
        }

        let cache = self.clone();
        let namespace = namespace.to_owned();
        let store_key = store_key.to_owned();
        self.inner.runner.submit(async move {
            cache.refresh_ahead(&namespace, &store_key, time).await;
        })
    }

    /// Background half of refresh-ahead, run on a worker.
    async fn refresh_ahead(&self, namespace: &str, store_key: &str, time: CacheTime) {
        let mut lock = DistributedLock::new(
            Arc::clone(&self.inner.store),
            self.inner.key_formatter.refresh_lock_name(store_key),
            self.inner.config.lock_lease,
        );
        if !lock.lock().await {
            debug!("Refresh for key {} already running elsewhere", store_key);
            return;
        }

        let result = async {
            // Re-check: another worker may have refreshed while we queued.
            match self.inner.store.ttl(store_key).await? {
                Some(ttl) if time.needs_refresh(ttl) => {
                    self.refresh_store_key(namespace, store_key, time).await?;
                }
                _ => debug!("Key {} no longer needs a refresh", store_key),
            }
            Ok::<_, CacheError>(())
        }
        .await;

        lock.unlock().await;

        if let Err(e) = result {
            warn!(
                "Refresh-ahead for key {} failed: {}. Keeping cached value.",
                store_key, e
            );
        }
    }
}
