//! Test doubles shared by the unit tests.

use async_trait::async_trait;

use crate::{CacheError, CacheStore};

/// Store whose every call fails, standing in for an unreachable Redis.
pub struct FailingStore;

fn unavailable() -> CacheError {
    CacheError::Unavailable("connection refused".to_owned())
}

#[async_trait]
impl CacheStore for FailingStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
        Err(unavailable())
    }

    async fn set_ex(&self, _key: &str, _value: String, _ttl_secs: u64) -> Result<(), CacheError> {
        Err(unavailable())
    }

    async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
        Err(unavailable())
    }

    async fn ttl(&self, _key: &str) -> Result<Option<u64>, CacheError> {
        Err(unavailable())
    }

    async fn del(&self, _key: &str) -> Result<(), CacheError> {
        Err(unavailable())
    }

    async fn set_nx_ex(
        &self,
        _key: &str,
        _value: &str,
        _ttl_secs: u64,
    ) -> Result<bool, CacheError> {
        Err(unavailable())
    }

    async fn del_if_eq(&self, _key: &str, _expected: &str) -> Result<bool, CacheError> {
        Err(unavailable())
    }
}
