pub mod bus;
pub mod memory;

pub use bus::*;
pub use memory::*;

use async_trait::async_trait;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared key/value state store. Values are JSON strings; keys follow the
/// `kind:{id}` convention (`progress:{task_id}`, `worker:{worker_id}`).
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Set a value, optionally bounded by a TTL. Setting an existing key
    /// replaces both value and TTL.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// All live keys with the given prefix.
    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}
