//! Typed cache for one namespace
//!
//! A [`NamespaceCache`] binds a [`RefreshCache`] to a namespace, a value type
//! and a backend that fetches values by id. Every id read through it gets a
//! registered invocation, so entries in a namespace with a preload window
//! refresh themselves ahead of expiry.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::registry::InvocationDescriptor;
use crate::{BoxError, CacheError, Cacheable, Loader, RefreshCache};

/// Trait for fetching values of one namespace from the backend.
///
/// Implementations can use a database, HTTP, or any other data source.
#[async_trait]
pub trait NamespaceBackend<V>: Send + Sync + 'static {
    /// Fetch the value for the given id, or None if it doesn't exist.
    async fn fetch(&self, id: &str) -> Result<Option<V>, BoxError>;
}

/// Adapter from a backend call for one id to the [`Loader`] trait.
struct BackendLoader<B> {
    backend: Arc<B>,
    id: String,
}

#[async_trait]
impl<V, B> Loader<V> for BackendLoader<B>
where
    V: Send + 'static,
    B: NamespaceBackend<V>,
{
    async fn load(&self) -> Result<Option<V>, BoxError> {
        self.backend.fetch(&self.id).await
    }
}

/// Refresh-ahead cache for values of type `V` in one namespace.
pub struct NamespaceCache<V, B> {
    cache: RefreshCache,
    namespace: String,
    backend: Arc<B>,
    _value: PhantomData<fn() -> V>,
}

impl<V, B> Clone for NamespaceCache<V, B> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            namespace: self.namespace.clone(),
            backend: Arc::clone(&self.backend),
            _value: PhantomData,
        }
    }
}

impl<V, B> NamespaceCache<V, B>
where
    V: Cacheable,
    B: NamespaceBackend<V>,
{
    /// Create a new NamespaceCache.
    ///
    /// # Arguments
    ///
    /// * `cache` - Shared refresh-ahead cache
    /// * `namespace` - Namespace whose cache time applies (e.g. `"orders"`)
    /// * `backend` - Backend for fetching values on a miss or refresh
    pub fn new(cache: RefreshCache, namespace: impl Into<String>, backend: B) -> Self {
        Self {
            cache,
            namespace: namespace.into(),
            backend: Arc::new(backend),
            _value: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Get the value for `id`, fetching it from the backend on a miss.
    pub async fn get(&self, id: &str) -> Result<Option<V>, CacheError> {
        self.cache
            .get_or_load(&self.namespace, id, self.loader(id))
            .await
            .into_result()
    }

    /// Get the value for `id` if cached, without touching the backend.
    pub async fn peek(&self, id: &str) -> Option<V> {
        self.cache.get(&self.namespace, id).await
    }

    /// Register `id` for refresh without reading it.
    pub fn register(&self, id: &str) {
        let descriptor = InvocationDescriptor::new(std::any::type_name::<B>(), "fetch")
            .with_argument("&str", serde_json::Value::String(id.to_owned()));
        self.cache
            .register_invocation::<_, V, _>(&self.namespace, id, descriptor, self.loader(id));
    }

    /// Re-fetch `id` from the backend and overwrite the cached value.
    pub async fn refresh(&self, id: &str) -> Result<bool, CacheError> {
        self.cache.refresh_cache_by_key(&self.namespace, id).await
    }

    /// Invalidate the cache entry for `id`.
    pub async fn invalidate(&self, id: &str) -> Result<(), CacheError> {
        self.cache.delete_cache_by_key(&self.namespace, id).await
    }

    fn loader(&self, id: &str) -> BackendLoader<B> {
        BackendLoader {
            backend: Arc::clone(&self.backend),
            id: id.to_owned(),
        }
    }
}
