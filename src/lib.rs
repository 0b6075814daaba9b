//! refresh-cache - Refresh-ahead read-through caching library
//!
//! This library puts a shared key-value store (Redis) in front of slow data
//! sources:
//! - Read-through loading with a distributed lock, so a cold key is loaded
//!   once across all instances
//! - Per-namespace expiration and preload window
//! - Refresh-ahead: reads near expiry replay the registered loader on a
//!   bounded background pool, off the caller's path
//! - Explicit refresh and delete by key
//! - Pluggable store, with an in-process store for tests and single-node use

mod config;
mod error;
mod lock;
mod memory_store;
mod namespace_cache;
mod refresh_cache;
pub mod registry;
mod runner;
mod store;

#[cfg(test)]
mod test_support;

pub use config::{CacheConfig, CacheTime};
pub use error::{BoxError, CacheError};
pub use lock::{DistributedLock, LOCK_KEY_PREFIX};
pub use memory_store::MemoryStore;
pub use namespace_cache::{NamespaceBackend, NamespaceCache};
pub use refresh_cache::{
    CacheKey, Cacheable, KeyFormatter, LoadOutcome, PrefixKeyFormatter, REFRESH_LOCK_SUFFIX,
    RefreshCache,
};
pub use registry::{
    CachedInvocation, FnLoader, InvocationDescriptor, InvocationKey, InvocationRegistry, Loader,
    loader_fn,
};
pub use runner::TaskRunner;
pub use store::{CacheStore, RedisStore, StoredEntry};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
