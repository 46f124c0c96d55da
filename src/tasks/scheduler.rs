//! Durable task scheduling on top of a [`TaskStore`] and named queues.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};

use super::definition::TaskDefinition;
use super::queue::{JobOptions, QueueJob, QueueStats};
use super::record::{TaskPatch, TaskRecord, TaskStatus, TaskUpdate};
use super::registry::QueueRegistry;
use crate::observability::RuntimeMetrics;
use crate::store::TaskStore;
use crate::types::TaskId;

#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub delay: Duration,
    /// Overrides the definition's priority.
    pub priority: Option<i32>,
    pub user_id: Option<String>,
}

impl ScheduleOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn delay_ms(self, ms: u64) -> Self {
        self.delay(Duration::from_millis(ms))
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Remaining delay until `record.delay_until`, never negative.
pub(crate) fn remaining_delay(record: &TaskRecord) -> Duration {
    record
        .delay_until
        .and_then(|at| (at - Utc::now()).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

pub struct TaskScheduler {
    store: Arc<dyn TaskStore>,
    queues: Arc<QueueRegistry>,
    metrics: Arc<RuntimeMetrics>,
}

impl TaskScheduler {
    pub fn new(store: Arc<dyn TaskStore>, queues: Arc<QueueRegistry>) -> Self {
        Self {
            store,
            queues,
            metrics: Arc::new(RuntimeMetrics::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RuntimeMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn queues(&self) -> &Arc<QueueRegistry> {
        &self.queues
    }

    /// Persists a task record and enqueues its job.
    ///
    /// An invalid payload fails before anything is written. If enqueueing
    /// fails the record stays `pending`/`delayed` and the error is returned.
    #[instrument(skip_all, fields(task = %definition.name, queue = %definition.queue))]
    pub async fn schedule(
        &self,
        definition: &TaskDefinition,
        payload: Value,
        options: ScheduleOptions,
    ) -> crate::Result<TaskRecord> {
        definition.validate(&payload)?;

        let is_delayed = !options.delay.is_zero();
        let mut record = TaskRecord::new(
            &definition.name,
            &definition.queue,
            payload,
            definition.max_attempts,
        );
        record.priority = options.priority.unwrap_or(definition.priority);
        record.user_id = options.user_id;
        if is_delayed {
            record.status = TaskStatus::Delayed;
            record.delay_until = Some(
                record.enqueued_at
                    + chrono::Duration::from_std(options.delay)
                        .map_err(|e| crate::Error::validation("delay", e.to_string()))?,
            );
        }

        self.store.create(&record).await?;
        self.metrics.tasks_scheduled.inc();

        let options = JobOptions::new()
            .job_id(record.id.to_string())
            .priority(record.priority)
            .delay(remaining_delay(&record))
            .attempts_made(record.attempts);
        let enqueued = match self.queues.get_or_create(&record.queue_name).await {
            Ok(queue) => {
                queue
                    .enqueue(&record.task_name, record.payload.clone(), options)
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = enqueued {
            warn!(task_id = %record.id, error = %e, "Task persisted but enqueue failed");
            return Err(e);
        }

        info!(task_id = %record.id, status = %record.status, "Task scheduled");
        Ok(record)
    }

    /// Removes a not-yet-started task from its queue and marks it failed.
    pub async fn cancel(&self, task_id: &TaskId) -> crate::Result<bool> {
        let record = self
            .store
            .get(task_id)
            .await?
            .ok_or_else(|| crate::Error::not_found("task", task_id))?;

        let queue = self.queues.get_or_create(&record.queue_name).await?;
        if !queue.remove(&task_id.to_string()).await? {
            return Ok(false);
        }

        self.store
            .update(
                task_id,
                &TaskPatch::new()
                    .status(TaskStatus::Failed)
                    .last_error(Some("cancelled".to_string())),
            )
            .await?;
        info!(task_id = %task_id, "Task cancelled");
        Ok(true)
    }

    pub async fn get(&self, task_id: &TaskId) -> crate::Result<Option<TaskRecord>> {
        Ok(self.store.get(task_id).await?)
    }

    pub async fn get_job(&self, record: &TaskRecord) -> crate::Result<Option<QueueJob>> {
        let queue = self.queues.get_or_create(&record.queue_name).await?;
        queue.get_job(&record.id.to_string()).await
    }

    pub async fn stats(&self, queue: &str) -> crate::Result<QueueStats> {
        self.queues.get_or_create(queue).await?.get_stats().await
    }

    /// Applies every update atomically; returns how many records matched.
    pub async fn bulk_update(&self, updates: &[TaskUpdate]) -> crate::Result<u64> {
        let matched = self.store.bulk_update(updates).await?;
        if matched < updates.len() as u64 {
            tracing::debug!(
                requested = updates.len(),
                matched,
                "Bulk update matched fewer records than requested"
            );
        }
        Ok(matched)
    }

    pub async fn list_for_user(&self, user_id: &str) -> crate::Result<Vec<TaskRecord>> {
        Ok(self.store.list_for_user(user_id).await?)
    }

    pub async fn close(&self) {
        self.queues.close_all().await;
    }
}
