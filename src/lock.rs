//! Distributed lock on top of the cache store
//!
//! A lock is a store key holding the owner's token, written with SET NX and a
//! lease. Release deletes the key only while it still holds our token, so a
//! holder whose lease ran out can never release someone else's lock.
//!
//! Lock keys live under [`LOCK_KEY_PREFIX`] so a lock named after a cache key
//! never collides with the cache entry itself.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::{CacheError, CacheStore};

/// Prefix of the store key backing every lock.
pub const LOCK_KEY_PREFIX: &str = "lock:";

/// Handle on a named lock in the shared store.
///
/// One handle represents one would-be owner. Acquire with [`lock`], release
/// with [`unlock`]. Dropping a held handle releases it on a spawned task.
///
/// [`lock`]: DistributedLock::lock
/// [`unlock`]: DistributedLock::unlock
pub struct DistributedLock {
    store: Arc<dyn CacheStore>,
    name: String,
    key: String,
    token: String,
    lease: Duration,
    held: bool,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn CacheStore>, name: impl Into<String>, lease: Duration) -> Self {
        let name = name.into();
        Self {
            store,
            key: format!("{LOCK_KEY_PREFIX}{name}"),
            name,
            token: Uuid::now_v7().to_string(),
            lease,
            held: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store key holding the owner token.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Token stored as the lock value while held.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Whether this handle believes it holds the lock. The lease may have
    /// run out in the store since.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Attempt to claim the lock, reporting store failures.
    pub async fn try_lock(&mut self) -> Result<bool, CacheError> {
        if self.held {
            return Ok(true);
        }
        let lease_secs = self.lease.as_secs().max(1);
        let acquired = self
            .store
            .set_nx_ex(&self.key, &self.token, lease_secs)
            .await?;
        self.held = acquired;
        Ok(acquired)
    }

    /// Attempt to claim the lock. A store failure counts as not acquired.
    pub async fn lock(&mut self) -> bool {
        match self.try_lock().await {
            Ok(acquired) => {
                debug!("Lock {} acquired: {}", self.name, acquired);
                acquired
            }
            Err(e) => {
                warn!(
                    "Lock {} could not be acquired, store error: {}. Treating as contended.",
                    self.name, e
                );
                false
            }
        }
    }

    /// Release the lock if this handle still owns it. No-op when the lock was
    /// never acquired. Returns whether the store key was deleted.
    pub async fn unlock(&mut self) -> bool {
        if !self.held {
            return false;
        }
        self.held = false;

        match self.store.del_if_eq(&self.key, &self.token).await {
            Ok(released) => {
                if !released {
                    debug!(
                        "Lock {} was no longer ours on release (lease expired)",
                        self.name
                    );
                }
                released
            }
            Err(e) => {
                warn!(
                    "Lock {} release failed: {}. Lease will expire on its own.",
                    self.name, e
                );
                false
            }
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if !self.held {
            return;
        }

        // Dropped while held: panic or cancellation between lock and unlock.
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.del_if_eq(&key, &token).await {
                        warn!("Lock {} release on drop failed: {}", key, e);
                    }
                });
            }
            Err(_) => {
                warn!(
                    "Lock {} dropped outside a runtime; lease will expire on its own",
                    self.name
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use crate::test_support::FailingStore;

    fn memory() -> Arc<dyn CacheStore> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn test_only_one_holder() {
        let store = memory();
        let lease = Duration::from_secs(5);
        let mut first = DistributedLock::new(Arc::clone(&store), "cache:orders:o1", lease);
        let mut second = DistributedLock::new(Arc::clone(&store), "cache:orders:o1", lease);

        assert!(first.lock().await);
        assert!(!second.lock().await);
        assert_ne!(first.token(), second.token());
        assert_eq!(first.key(), "lock:cache:orders:o1");
        // the cache entry itself is untouched
        assert!(!store.exists("cache:orders:o1").await.unwrap());

        assert!(first.unlock().await);
        assert!(second.lock().await);
        assert!(second.unlock().await);
    }

    #[tokio::test]
    async fn test_unlock_without_lock_is_noop() {
        let store = memory();
        let mut holder = DistributedLock::new(Arc::clone(&store), "l", Duration::from_secs(5));
        let mut bystander = DistributedLock::new(Arc::clone(&store), "l", Duration::from_secs(5));

        assert!(holder.lock().await);
        assert!(!bystander.unlock().await);
        assert!(store.exists("lock:l").await.unwrap());
        holder.unlock().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_superseded_owner_cannot_release() {
        let store = memory();
        let mut stale = DistributedLock::new(Arc::clone(&store), "l", Duration::from_secs(1));
        assert!(stale.lock().await);

        tokio::time::advance(Duration::from_secs(2)).await;

        let mut current = DistributedLock::new(Arc::clone(&store), "l", Duration::from_secs(5));
        assert!(current.lock().await);

        assert!(!stale.unlock().await);
        assert_eq!(
            store.get(current.key()).await.unwrap().as_deref(),
            Some(current.token())
        );
        assert!(current.unlock().await);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed() {
        let store: Arc<dyn CacheStore> = Arc::new(FailingStore);
        let mut lock = DistributedLock::new(store, "l", Duration::from_secs(5));

        assert!(lock.try_lock().await.is_err());
        assert!(!lock.lock().await);
        assert!(!lock.is_held());
        assert!(!lock.unlock().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_held_lock() {
        let store = memory();
        {
            let mut lock =
                DistributedLock::new(Arc::clone(&store), "l", Duration::from_secs(30));
            assert!(lock.lock().await);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!store.exists("lock:l").await.unwrap());
    }
}
