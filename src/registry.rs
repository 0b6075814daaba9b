//! Invocation registry
//!
//! Refresh-ahead has to recompute a value without the caller that first
//! loaded it. The registry remembers, per `(namespace, key)`, a descriptor of
//! the loading call together with a type-erased [`Loader`] that can replay it.
//!
//! Registrations live until the entry is deleted or, when built with
//! [`InvocationRegistry::with_time_to_idle`], until they go unused for that
//! long. Losing them only degrades refresh-ahead back to plain expiry.

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

use crate::{BoxError, CacheError, Cacheable};

/// Computes the value for one cache entry.
///
/// `Ok(None)` means the value legitimately does not exist.
#[async_trait]
pub trait Loader<V>: Send + Sync + 'static {
    async fn load(&self) -> Result<Option<V>, BoxError>;
}

/// [`Loader`] built from an async closure. See [`loader_fn`].
#[derive(Clone)]
pub struct FnLoader<F> {
    f: F,
}

/// Wrap an async closure as a [`Loader`].
///
/// ```rust,ignore
/// let loader = loader_fn(move || {
///     let db = db.clone();
///     async move { db.find_order(&id).await.map_err(Into::into) }
/// });
/// ```
pub fn loader_fn<V, F, Fut>(f: F) -> FnLoader<F>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Option<V>, BoxError>>,
{
    FnLoader { f }
}

#[async_trait]
impl<V, F, Fut> Loader<V> for FnLoader<F>
where
    V: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<V>, BoxError>> + Send + 'static,
{
    async fn load(&self) -> Result<Option<V>, BoxError> {
        (self.f)().await
    }
}

/// Type-erased loader producing the JSON form of its value.
#[async_trait]
pub trait Replay: Send + Sync {
    async fn replay(&self) -> Result<Option<serde_json::Value>, CacheError>;
}

struct TypedReplay<V, L> {
    loader: Arc<L>,
    _value: PhantomData<fn() -> V>,
}

#[async_trait]
impl<V, L> Replay for TypedReplay<V, L>
where
    V: Cacheable,
    L: Loader<V>,
{
    async fn replay(&self) -> Result<Option<serde_json::Value>, CacheError> {
        match self.loader.load().await.map_err(CacheError::Loader)? {
            Some(value) => Ok(Some(serde_json::to_value(&value)?)),
            None => Ok(None),
        }
    }
}

/// Erase the value type of a shared loader.
pub fn erase<V, L>(loader: Arc<L>) -> Arc<dyn Replay>
where
    V: Cacheable,
    L: Loader<V>,
{
    Arc::new(TypedReplay {
        loader,
        _value: PhantomData,
    })
}

/// Identity of a registered invocation: cache namespace plus store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationKey {
    pub namespace: String,
    pub key: String,
}

impl InvocationKey {
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.key)
    }
}

/// What was called to produce a value: target, method and arguments.
///
/// Kept for diagnostics; the replay itself goes through the registered loader.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationDescriptor {
    pub target: String,
    pub method: String,
    pub parameter_types: Vec<String>,
    pub arguments: Vec<serde_json::Value>,
}

impl InvocationDescriptor {
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            ..Self::default()
        }
    }

    /// Append an argument with its type name.
    pub fn with_argument(
        mut self,
        parameter_type: impl Into<String>,
        argument: serde_json::Value,
    ) -> Self {
        self.parameter_types.push(parameter_type.into());
        self.arguments.push(argument);
        self
    }
}

/// A registered, replayable loading call.
///
/// Equality and hashing only look at the [`InvocationKey`].
#[derive(Clone)]
pub struct CachedInvocation {
    key: InvocationKey,
    descriptor: InvocationDescriptor,
    replay: Arc<dyn Replay>,
}

impl CachedInvocation {
    pub fn new(
        key: InvocationKey,
        descriptor: InvocationDescriptor,
        replay: Arc<dyn Replay>,
    ) -> Self {
        Self {
            key,
            descriptor,
            replay,
        }
    }

    pub fn key(&self) -> &InvocationKey {
        &self.key
    }

    pub fn descriptor(&self) -> &InvocationDescriptor {
        &self.descriptor
    }

    /// Run the recorded loading call again.
    pub async fn replay(&self) -> Result<Option<serde_json::Value>, CacheError> {
        self.replay.replay().await
    }
}

impl PartialEq for CachedInvocation {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for CachedInvocation {}

impl Hash for CachedInvocation {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Debug for CachedInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedInvocation")
            .field("key", &self.key)
            .field("target", &self.descriptor.target)
            .field("method", &self.descriptor.method)
            .field("parameter_types", &self.descriptor.parameter_types)
            .finish_non_exhaustive()
    }
}

/// Concurrent map from `(namespace, key)` to the invocation that loads it.
#[derive(Clone)]
pub struct InvocationRegistry {
    invocations: Cache<InvocationKey, Arc<CachedInvocation>>,
}

impl Default for InvocationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvocationRegistry {
    pub fn new() -> Self {
        Self {
            invocations: Cache::builder().build(),
        }
    }

    /// Registry that forgets invocations neither registered nor looked up
    /// for `idle`.
    pub fn with_time_to_idle(idle: Duration) -> Self {
        Self {
            invocations: Cache::builder().time_to_idle(idle).build(),
        }
    }

    /// Store or replace the invocation for its key.
    pub fn register(&self, invocation: CachedInvocation) {
        let key = invocation.key().clone();
        self.invocations.insert(key, Arc::new(invocation));
    }

    pub fn lookup(&self, namespace: &str, key: &str) -> Option<Arc<CachedInvocation>> {
        self.invocations.get(&InvocationKey::new(namespace, key))
    }

    pub fn remove(&self, namespace: &str, key: &str) -> Option<Arc<CachedInvocation>> {
        self.invocations.remove(&InvocationKey::new(namespace, key))
    }

    pub fn contains(&self, namespace: &str, key: &str) -> bool {
        self.invocations
            .contains_key(&InvocationKey::new(namespace, key))
    }

    pub fn len(&self) -> usize {
        self.invocations.run_pending_tasks();
        self.invocations.entry_count() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn constant(value: &'static str) -> Arc<dyn Replay> {
        erase::<String, _>(Arc::new(loader_fn(move || async move {
            Ok::<_, BoxError>(Some(value.to_owned()))
        })))
    }

    fn invocation(key: &str, value: &'static str) -> CachedInvocation {
        CachedInvocation::new(
            InvocationKey::new("orders", key),
            InvocationDescriptor::new("OrderService", "find_order")
                .with_argument("String", json!(key)),
            constant(value),
        )
    }

    #[tokio::test]
    async fn test_register_and_replay() {
        let registry = InvocationRegistry::new();
        registry.register(invocation("cache:orders:o1", "v1"));

        let found = registry.lookup("orders", "cache:orders:o1").unwrap();
        assert_eq!(found.descriptor().method, "find_order");
        assert_eq!(found.descriptor().arguments, vec![json!("cache:orders:o1")]);
        assert_eq!(found.replay().await.unwrap(), Some(json!("v1")));

        assert!(registry.lookup("orders", "cache:orders:o2").is_none());
        assert!(registry.lookup("users", "cache:orders:o1").is_none());
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = InvocationRegistry::new();
        registry.register(invocation("k", "first"));
        registry.register(invocation("k", "second"));

        assert_eq!(registry.len(), 1);
        let found = registry.lookup("orders", "k").unwrap();
        assert_eq!(found.replay().await.unwrap(), Some(json!("second")));
    }

    #[test]
    fn test_remove() {
        let registry = InvocationRegistry::new();
        registry.register(invocation("k", "v"));
        assert!(registry.contains("orders", "k"));

        assert!(registry.remove("orders", "k").is_some());
        assert!(!registry.contains("orders", "k"));
        assert!(registry.remove("orders", "k").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_idle_registrations_are_forgotten() {
        let registry = InvocationRegistry::with_time_to_idle(Duration::from_millis(50));
        registry.register(invocation("stale", "v"));
        registry.register(invocation("busy", "v"));

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(20));
            assert!(registry.lookup("orders", "busy").is_some());
        }

        assert!(registry.lookup("orders", "stale").is_none());
        assert!(registry.contains("orders", "busy"));
    }

    #[test]
    fn test_identity_is_the_key_only() {
        let a = invocation("k", "a");
        let mut b = invocation("k", "b");
        b.descriptor.arguments.push(json!(42));

        assert_eq!(a, b);
        let set: HashSet<_> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[tokio::test]
    async fn test_loader_error_surfaces_from_replay() {
        let failing = erase::<String, _>(Arc::new(loader_fn(|| async {
            Err::<Option<String>, BoxError>("database down".into())
        })));
        let err = failing.replay().await.unwrap_err();
        assert!(matches!(err, CacheError::Loader(_)));
    }

    #[test]
    fn test_concurrent_registration_on_distinct_keys() {
        let registry = InvocationRegistry::new();
        std::thread::scope(|scope| {
            for t in 0..8 {
                let registry = registry.clone();
                scope.spawn(move || {
                    for i in 0..100 {
                        let key = format!("k{t}-{i}");
                        registry.register(CachedInvocation::new(
                            InvocationKey::new("orders", key),
                            InvocationDescriptor::default(),
                            constant("v"),
                        ));
                    }
                });
            }
        });
        assert_eq!(registry.len(), 800);
    }
}
