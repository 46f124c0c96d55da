//! Per-name cache of queue clients.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use super::queue::{MemoryQueueFactory, Queue, QueueFactory};

/// Creates each named queue once and hands out the shared client afterwards.
pub struct QueueRegistry {
    factory: Arc<dyn QueueFactory>,
    queues: DashMap<String, Arc<dyn Queue>>,
}

impl QueueRegistry {
    pub fn new(factory: Arc<dyn QueueFactory>) -> Self {
        Self {
            factory,
            queues: DashMap::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryQueueFactory))
    }

    pub async fn get_or_create(&self, name: &str) -> crate::Result<Arc<dyn Queue>> {
        if let Some(queue) = self.queues.get(name) {
            return Ok(Arc::clone(queue.value()));
        }

        let created = self.factory.create(name).await?;
        // Another caller may have raced us; keep whichever landed first.
        let queue = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(queue = %name, "Created queue client");
                created
            })
            .clone();
        Ok(queue)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Queue>> {
        self.queues.get(name).map(|q| Arc::clone(q.value()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Closes every cached queue and empties the cache.
    pub async fn close_all(&self) {
        let queues: Vec<Arc<dyn Queue>> = self.queues.iter().map(|e| Arc::clone(e.value())).collect();
        self.queues.clear();
        for queue in queues {
            if let Err(e) = queue.close().await {
                warn!(queue = %queue.name(), error = %e, "Failed to close queue");
            }
        }
    }
}

impl Default for QueueRegistry {
    fn default() -> Self {
        Self::in_memory()
    }
}
