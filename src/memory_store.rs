//! In-process store
//!
//! [`MemoryStore`] implements [`CacheStore`] on a single mutex-guarded map
//! with Redis-like TTL semantics. Expiry is measured on the tokio clock, so
//! it follows paused and advanced time in tests. It gives mutual exclusion
//! between tasks of one process only.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{CacheError, CacheStore};

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// [`CacheStore`] kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| e.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Store `value` without an expiry.
    pub async fn set_persistent(&self, key: &str, value: String) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_owned(),
            MemoryEntry {
                value,
                expires_at: None,
            },
        );
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, MemoryEntry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a MemoryEntry> {
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        entries.get(key)
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key, Instant::now()).map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: String, ttl_secs: u64) -> Result<(), CacheError> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_owned(),
            MemoryEntry {
                value,
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key, Instant::now()).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(Self::live(&mut entries, key, now)
            .and_then(|e| e.expires_at)
            .map(|at| {
                // round to the nearest second like Redis TTL does
                let millis = at.saturating_duration_since(now).as_millis();
                ((millis + 500) / 1000) as u64
            }))
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            MemoryEntry {
                value: value.to_owned(),
                expires_at: Some(now + Duration::from_secs(ttl_secs.max(1))),
            },
        );
        Ok(true)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().await;
        match Self::live(&mut entries, key, Instant::now()) {
            Some(entry) if entry.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_on_the_tokio_clock() {
        let store = MemoryStore::new();
        store.set_ex("k", "v".to_owned(), 60).await.unwrap();
        assert_eq!(store.ttl("k").await.unwrap(), Some(60));

        tokio::time::advance(Duration::from_secs(52)).await;
        assert_eq!(store.ttl("k").await.unwrap(), Some(8));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(store.ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_ttl_is_none_without_expiry() {
        let store = MemoryStore::new();
        store.set_persistent("k", "v".to_owned()).await;
        assert_eq!(store.ttl("k").await.unwrap(), None);
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_respects_live_keys_only() {
        let store = MemoryStore::new();
        assert!(store.set_nx_ex("lock", "a", 5).await.unwrap());
        assert!(!store.set_nx_ex("lock", "b", 5).await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(store.set_nx_ex("lock", "b", 5).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_del_if_eq_only_removes_matching_value() {
        let store = MemoryStore::new();
        store.set_ex("lock", "owner".to_owned(), 10).await.unwrap();

        assert!(!store.del_if_eq("lock", "intruder").await.unwrap());
        assert!(store.exists("lock").await.unwrap());

        assert!(store.del_if_eq("lock", "owner").await.unwrap());
        assert!(!store.exists("lock").await.unwrap());
        assert!(!store.del_if_eq("lock", "owner").await.unwrap());
    }
}
