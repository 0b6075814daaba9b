//! Cache error types

use std::time::Duration;

use redis::RedisError;

/// Error type returned by loaders and invocation replays.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Cache-related errors
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Redis error: {0}")]
    Redis(#[from] RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Loader error: {0}")]
    Loader(BoxError),

    #[error("Loader timed out after {0:?}")]
    LoadTimeout(Duration),

    #[error("Load lock still contended after {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}
