//! Cache configuration

use std::collections::HashMap;
use std::time::Duration;

/// Expiration and refresh-ahead window for one cache namespace.
///
/// `preload_secs` is how long before expiry a read starts a background
/// refresh. Zero disables refresh-ahead for the namespace. A window that is
/// not shorter than the expiration is accepted; it simply means every read
/// schedules a refresh check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTime {
    preload_secs: u64,
    expiration_secs: u64,
}

impl CacheTime {
    /// Create a new cache time. Expiration is clamped to one second since
    /// Redis rejects `SET .. EX 0`.
    pub fn new(preload_secs: u64, expiration_secs: u64) -> Self {
        Self {
            preload_secs,
            expiration_secs: expiration_secs.max(1),
        }
    }

    /// Expiration only, refresh-ahead disabled.
    pub fn expiring(expiration_secs: u64) -> Self {
        Self::new(0, expiration_secs)
    }

    pub fn preload_secs(&self) -> u64 {
        self.preload_secs
    }

    pub fn expiration_secs(&self) -> u64 {
        self.expiration_secs
    }

    pub fn refresh_enabled(&self) -> bool {
        self.preload_secs > 0
    }

    /// Whether the refresh window opens after the entry is written.
    pub fn is_well_formed(&self) -> bool {
        self.preload_secs < self.expiration_secs
    }

    /// Whether an entry with `remaining_secs` left is due for refresh.
    pub fn needs_refresh(&self, remaining_secs: u64) -> bool {
        self.refresh_enabled() && remaining_secs <= self.preload_secs
    }
}

impl Default for CacheTime {
    fn default() -> Self {
        Self::expiring(900) // 15 minutes
    }
}

/// Configuration for the refresh-ahead cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Prefix for every Redis key written by the cache
    pub key_prefix: String,
    /// Cache time for namespaces without an explicit entry
    pub default_time: CacheTime,
    /// Per-namespace cache times
    pub namespaces: HashMap<String, CacheTime>,
    /// Lease on load and refresh locks
    pub lock_lease: Duration,
    /// Sleep between attempts when another caller holds the load lock
    pub retry_backoff: Duration,
    /// Maximum lookup attempts for a single `get_or_load`
    pub max_load_attempts: u32,
    /// Wall-clock bound for a single `get_or_load` under contention
    pub contention_deadline: Duration,
    /// Timeout applied to loader calls and refresh replays, capped at
    /// `lock_lease`
    pub load_timeout: Duration,
    /// TTL for confirmed-absent markers; zero disables negative caching
    pub absent_ttl: Duration,
    /// Number of background refresh workers
    pub refresh_workers: usize,
    /// Capacity of the refresh job queue
    pub refresh_queue_capacity: usize,
    /// Idle time after which a registered invocation is forgotten; `None`
    /// derives it from the longest expiration
    pub registration_idle: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "cache:".to_owned(),
            default_time: CacheTime::default(),
            namespaces: HashMap::new(),
            lock_lease: Duration::from_secs(10),
            retry_backoff: Duration::from_millis(100),
            max_load_attempts: 100,
            contention_deadline: Duration::from_secs(15),
            load_timeout: Duration::from_secs(10),
            absent_ttl: Duration::ZERO,
            refresh_workers: 4,
            refresh_queue_capacity: 256,
            registration_idle: None,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the cache time for a namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>, time: CacheTime) -> Self {
        self.namespaces.insert(namespace.into(), time);
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_default_time(mut self, time: CacheTime) -> Self {
        self.default_time = time;
        self
    }

    pub fn with_lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = lease;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_max_load_attempts(mut self, attempts: u32) -> Self {
        self.max_load_attempts = attempts.max(1);
        self
    }

    pub fn with_contention_deadline(mut self, deadline: Duration) -> Self {
        self.contention_deadline = deadline;
        self
    }

    pub fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    pub fn with_absent_ttl(mut self, ttl: Duration) -> Self {
        self.absent_ttl = ttl;
        self
    }

    pub fn with_refresh_workers(mut self, workers: usize, queue_capacity: usize) -> Self {
        self.refresh_workers = workers.max(1);
        self.refresh_queue_capacity = queue_capacity.max(1);
        self
    }

    pub fn with_registration_idle(mut self, idle: Duration) -> Self {
        self.registration_idle = Some(idle);
        self
    }

    /// Timeout for a loader or replay. Never longer than the lock lease, so
    /// the lock cannot expire under a running loader.
    pub fn effective_load_timeout(&self) -> Duration {
        self.load_timeout.min(self.lock_lease)
    }

    /// How long an unused registration is kept: the configured value, or
    /// twice the longest expiration of any namespace.
    pub fn registration_idle(&self) -> Duration {
        self.registration_idle.unwrap_or_else(|| {
            let longest = self
                .namespaces
                .values()
                .chain(std::iter::once(&self.default_time))
                .map(CacheTime::expiration_secs)
                .max()
                .unwrap_or(1);
            Duration::from_secs(longest.saturating_mul(2))
        })
    }

    /// Cache time for `namespace`, falling back to the default.
    pub fn time_for(&self, namespace: &str) -> CacheTime {
        self.namespaces
            .get(namespace)
            .copied()
            .unwrap_or(self.default_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_time_falls_back_to_default() {
        let config = CacheConfig::new()
            .with_default_time(CacheTime::expiring(30))
            .with_namespace("orders", CacheTime::new(10, 60));

        assert_eq!(config.time_for("orders"), CacheTime::new(10, 60));
        assert_eq!(config.time_for("users"), CacheTime::expiring(30));
    }

    #[test]
    fn test_refresh_window() {
        let time = CacheTime::new(10, 60);
        assert!(time.needs_refresh(8));
        assert!(time.needs_refresh(10));
        assert!(!time.needs_refresh(11));

        // preload of zero never refreshes, even at the last second
        assert!(!CacheTime::expiring(60).needs_refresh(0));
    }

    #[test]
    fn test_misconfigured_window_is_tolerated() {
        let time = CacheTime::new(120, 60);
        assert!(!time.is_well_formed());
        assert!(time.needs_refresh(59));
    }

    #[test]
    fn test_load_timeout_never_outlives_lease() {
        let config = CacheConfig::new()
            .with_lock_lease(Duration::from_secs(2))
            .with_load_timeout(Duration::from_secs(30));
        assert_eq!(config.effective_load_timeout(), Duration::from_secs(2));

        let config = config.with_load_timeout(Duration::from_millis(500));
        assert_eq!(config.effective_load_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_registration_idle_follows_longest_expiration() {
        let config = CacheConfig::new()
            .with_default_time(CacheTime::expiring(30))
            .with_namespace("orders", CacheTime::new(10, 600));
        assert_eq!(config.registration_idle(), Duration::from_secs(1200));

        let config = config.with_registration_idle(Duration::from_secs(5));
        assert_eq!(config.registration_idle(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_expiration_is_clamped() {
        assert_eq!(CacheTime::new(0, 0).expiration_secs(), 1);
    }
}
