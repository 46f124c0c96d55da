//! Storage collaborators: a TTL key-value store for run state and signals,
//! and a transactional task store for task records.

mod kv;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis-backend")]
pub mod redis_store;
mod repository;
mod task_store;

pub use kv::{KeyValueStore, MemoryKeyValueStore};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresTaskStore};
#[cfg(feature = "redis-backend")]
pub use redis_store::{RedisConfig, RedisKeyValueStore};
pub use repository::{Keyed, KvRepository};
pub use task_store::{MemoryTaskStore, TaskStore};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    /// The backing service could not be reached.
    #[error("Storage unavailable: {message}")]
    Unavailable { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(any(feature = "postgres", feature = "redis-backend"))]
pub(crate) trait StorageResultExt<T> {
    fn storage_err(self) -> StoreResult<T>;
    fn storage_err_ctx(self, context: &str) -> StoreResult<T>;
}

#[cfg(any(feature = "postgres", feature = "redis-backend"))]
impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err(self) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: e.to_string(),
        })
    }

    fn storage_err_ctx(self, context: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Storage {
            message: format!("{}: {}", context, e),
        })
    }
}

#[cfg(any(feature = "postgres", feature = "redis-backend"))]
pub(crate) fn is_transient(error: &StoreError) -> bool {
    match error {
        StoreError::Unavailable { .. } => true,
        StoreError::Storage { message } => {
            message.contains("timeout")
                || message.contains("connection")
                || message.contains("BUSY")
                || message.contains("LOADING")
        }
        _ => false,
    }
}

#[cfg(any(feature = "postgres", feature = "redis-backend"))]
pub(crate) async fn with_retry<F, Fut, T>(
    max_retries: u32,
    backoff: &crate::tasks::ExponentialBackoff,
    operation: F,
) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries && is_transient(&e) => {
                attempt += 1;
                tracing::warn!(attempt, error = %e, "Retrying storage operation");
                tokio::time::sleep(backoff.delay_for(attempt)).await;
            }
            Err(e) => return Err(e),
        }
    }
}
