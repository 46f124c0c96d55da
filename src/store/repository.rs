//! Typed CRUD over a [`KeyValueStore`], parameterized by entity.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{KeyValueStore, StoreError, StoreResult};

/// An entity stored under `{namespace}:{key}`.
pub trait Keyed {
    const NAMESPACE: &'static str;

    fn key(&self) -> String;
}

pub struct KvRepository<T> {
    store: Arc<dyn KeyValueStore>,
    ttl: Option<Duration>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for KvRepository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ttl: self.ttl,
            _entity: PhantomData,
        }
    }
}

impl<T> KvRepository<T>
where
    T: Keyed + Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            ttl: None,
            _entity: PhantomData,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    fn storage_key(key: &str) -> String {
        format!("{}:{}", T::NAMESPACE, key)
    }

    pub async fn save(&self, entity: &T) -> StoreResult<()> {
        let data = serde_json::to_string(entity)?;
        self.store
            .set(&Self::storage_key(&entity.key()), &data, self.ttl)
            .await
    }

    pub async fn load(&self, key: &str) -> StoreResult<Option<T>> {
        match self.store.get(&Self::storage_key(key)).await? {
            Some(data) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    pub async fn require(&self, key: &str) -> StoreResult<T> {
        self.load(key).await?.ok_or_else(|| StoreError::NotFound {
            entity: T::NAMESPACE,
            id: key.to_string(),
        })
    }

    pub async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.store.delete(&Self::storage_key(key)).await
    }
}
