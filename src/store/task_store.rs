//! Relational-style storage for task records.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{StoreError, StoreResult};
use crate::tasks::{TaskPatch, TaskRecord, TaskStatus, TaskUpdate};
use crate::types::TaskId;

#[async_trait]
pub trait TaskStore: Send + Sync {
    fn name(&self) -> &str;

    async fn create(&self, record: &TaskRecord) -> StoreResult<()>;

    async fn get(&self, id: &TaskId) -> StoreResult<Option<TaskRecord>>;

    /// Merges `patch` into the record, returning the updated record if it exists.
    async fn update(&self, id: &TaskId, patch: &TaskPatch) -> StoreResult<Option<TaskRecord>>;

    /// Applies every update in one atomic batch and returns how many ids matched.
    async fn bulk_update(&self, updates: &[TaskUpdate]) -> StoreResult<u64>;

    async fn list_by_status(&self, status: TaskStatus) -> StoreResult<Vec<TaskRecord>>;

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<TaskRecord>>;
}

#[derive(Clone, Default)]
pub struct MemoryTaskStore {
    records: Arc<RwLock<HashMap<TaskId, TaskRecord>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

fn sorted(mut records: Vec<TaskRecord>) -> Vec<TaskRecord> {
    records.sort_by_key(|r| r.enqueued_at);
    records
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create(&self, record: &TaskRecord) -> StoreResult<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(StoreError::Storage {
                message: format!("task {} already exists", record.id),
            });
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: &TaskId) -> StoreResult<Option<TaskRecord>> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update(&self, id: &TaskId, patch: &TaskPatch) -> StoreResult<Option<TaskRecord>> {
        let mut records = self.records.write().await;
        Ok(records.get_mut(id).map(|record| {
            patch.apply(record);
            record.clone()
        }))
    }

    async fn bulk_update(&self, updates: &[TaskUpdate]) -> StoreResult<u64> {
        let mut records = self.records.write().await;
        let mut matched = 0;
        for update in updates {
            if let Some(record) = records.get_mut(&update.id) {
                update.patch.apply(record);
                matched += 1;
            }
        }
        Ok(matched)
    }

    async fn list_by_status(&self, status: TaskStatus) -> StoreResult<Vec<TaskRecord>> {
        let records = self.records.read().await;
        Ok(sorted(
            records
                .values()
                .filter(|r| r.status == status)
                .cloned()
                .collect(),
        ))
    }

    async fn list_for_user(&self, user_id: &str) -> StoreResult<Vec<TaskRecord>> {
        let records = self.records.read().await;
        Ok(sorted(
            records
                .values()
                .filter(|r| r.user_id.as_deref() == Some(user_id))
                .cloned()
                .collect(),
        ))
    }
}
