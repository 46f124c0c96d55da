//! Redis key-value store for run state, locks and cancellation signals.
//!
//! Enable with the `redis-backend` feature flag.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;

use super::{KeyValueStore, StorageResultExt, StoreError, StoreResult, with_retry};
use crate::tasks::ExponentialBackoff;

#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub key_prefix: String,
    pub connection_timeout: Duration,
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            key_prefix: "orchestrator:".to_string(),
            connection_timeout: Duration::from_secs(10),
            max_retries: 3,
            backoff: ExponentialBackoff::new(
                Duration::from_millis(100),
                Duration::from_secs(5),
                2.0,
            ),
        }
    }
}

impl RedisConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> StoreResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        {
            return Err(StoreError::Storage {
                message: format!(
                    "Invalid key prefix '{}': only ASCII alphanumeric, underscore, and colon allowed",
                    prefix
                ),
            });
        }
        self.key_prefix = prefix;
        Ok(self)
    }
}

pub struct RedisKeyValueStore {
    client: Arc<redis::Client>,
    config: RedisConfig,
}

impl RedisKeyValueStore {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Self::from_config(redis_url, RedisConfig::default())
    }

    pub fn from_config(redis_url: &str, config: RedisConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    pub(crate) fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    pub(crate) async fn connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        with_retry(self.config.max_retries, &self.config.backoff, || async {
            tokio::time::timeout(
                self.config.connection_timeout,
                self.client.get_multiplexed_async_connection(),
            )
            .await
            .map_err(|_| StoreError::Unavailable {
                message: "redis connection timeout".to_string(),
            })?
            .map_err(|e| StoreError::Unavailable {
                message: e.to_string(),
            })
        })
        .await
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get(self.key(key)).await.storage_err()
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        cmd.query_async::<()>(&mut conn).await.storage_err()
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(ttl));
        }
        let reply: Option<String> = cmd.query_async(&mut conn).await.storage_err()?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let deleted: i64 = conn.del(self.key(key)).await.storage_err()?;
        Ok(deleted > 0)
    }
}
