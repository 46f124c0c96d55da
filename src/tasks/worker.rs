//! Consumer side: reserves jobs, runs handlers and records the outcome.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backoff::ExponentialBackoff;
use super::queue::{JobOptions, Queue, QueueJob};
use super::record::{TaskPatch, TaskRecord, TaskStatus};
use super::registry::QueueRegistry;
use crate::observability::RuntimeMetrics;
use crate::store::TaskStore;
use crate::types::TaskId;

/// Executes one kind of task, selected by [`TaskHandler::task_name`].
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_name(&self) -> &str;

    async fn handle(&self, task: &TaskRecord) -> crate::Result<()>;
}

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct TaskWorker {
    store: Arc<dyn TaskStore>,
    queues: Arc<QueueRegistry>,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    backoff: ExponentialBackoff,
    poll_interval: Duration,
    metrics: Arc<RuntimeMetrics>,
}

impl TaskWorker {
    pub fn new(store: Arc<dyn TaskStore>, queues: Arc<QueueRegistry>) -> Self {
        Self {
            store,
            queues,
            handlers: HashMap::new(),
            backoff: ExponentialBackoff::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            metrics: Arc::new(RuntimeMetrics::new()),
        }
    }

    pub fn register(mut self, handler: impl TaskHandler + 'static) -> Self {
        self.handlers
            .insert(handler.task_name().to_string(), Arc::new(handler));
        self
    }

    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<RuntimeMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Processes at most one ready job. Returns the updated record, or `None`
    /// when the queue had nothing ready.
    #[instrument(skip(self), fields(queue = %queue_name))]
    pub async fn process_next(&self, queue_name: &str) -> crate::Result<Option<TaskRecord>> {
        let queue = self.queues.get_or_create(queue_name).await?;
        let Some(job) = queue.reserve().await? else {
            return Ok(None);
        };

        let task_id: TaskId = job.id.parse()?;
        let Some(record) = self.store.get(&task_id).await? else {
            warn!(job_id = %job.id, "Job has no task record; dropping");
            queue.fail(&job.id, "task record not found").await?;
            return Ok(None);
        };

        let attempts = record.attempts + 1;
        let running = self
            .store
            .update(
                &task_id,
                &TaskPatch::new()
                    .status(TaskStatus::Running)
                    .attempts(attempts)
                    .delay_until(None),
            )
            .await?
            .ok_or_else(|| crate::Error::not_found("task", task_id))?;
        self.metrics.task_attempts.inc();
        debug!(task_id = %task_id, attempt = attempts, "Processing task");

        let outcome = match self.handlers.get(&running.task_name) {
            Some(handler) => handler.handle(&running).await,
            None => Err(crate::Error::BadRequest(format!(
                "no handler registered for task '{}'",
                running.task_name
            ))),
        };

        let updated = match outcome {
            Ok(()) => {
                queue.complete(&job.id).await?;
                info!(task_id = %task_id, attempt = attempts, "Task complete");
                self.patch(&task_id, TaskPatch::new().status(TaskStatus::Complete).last_error(None))
                    .await?
            }
            Err(e) => self.handle_failure(queue.as_ref(), &job, &running, e).await?,
        };
        Ok(Some(updated))
    }

    async fn handle_failure(
        &self,
        queue: &dyn Queue,
        job: &QueueJob,
        record: &TaskRecord,
        error: crate::Error,
    ) -> crate::Result<TaskRecord> {
        let message = error.to_string();
        queue.fail(&job.id, &message).await?;

        if error.is_retryable() && record.has_attempts_left() {
            let delay = error
                .retry_after()
                .unwrap_or_else(|| self.backoff.delay_for(record.attempts));
            let delay_until = chrono::Duration::from_std(delay)
                .ok()
                .map(|d| chrono::Utc::now() + d);

            let retried = self
                .patch(
                    &record.id,
                    TaskPatch::new()
                        .status(TaskStatus::Delayed)
                        .delay_until(delay_until)
                        .last_error(Some(message.clone())),
                )
                .await?;
            queue
                .enqueue(
                    &record.task_name,
                    record.payload.clone(),
                    JobOptions::new()
                        .job_id(job.id.clone())
                        .priority(record.priority)
                        .delay(delay)
                        .attempts_made(record.attempts),
                )
                .await?;
            warn!(
                task_id = %record.id,
                attempt = record.attempts,
                retry_in_ms = delay.as_millis() as u64,
                error = %message,
                "Task failed; retry scheduled"
            );
            return Ok(retried);
        }

        self.metrics.task_failures.inc();
        warn!(task_id = %record.id, attempt = record.attempts, error = %message, "Task failed");
        self.patch(
            &record.id,
            TaskPatch::new()
                .status(TaskStatus::Failed)
                .last_error(Some(message)),
        )
        .await
    }

    async fn patch(&self, id: &TaskId, patch: TaskPatch) -> crate::Result<TaskRecord> {
        self.store
            .update(id, &patch)
            .await?
            .ok_or_else(|| crate::Error::not_found("task", id))
    }

    /// Processes jobs from `queue_name` until `shutdown` fires.
    pub async fn run(&self, queue_name: &str, shutdown: CancellationToken) -> crate::Result<()> {
        info!(queue = %queue_name, "Task worker started");
        while !shutdown.is_cancelled() {
            match self.process_next(queue_name).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    warn!(queue = %queue_name, error = %e, "Worker poll failed");
                }
                Err(e) => return Err(e),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!(queue = %queue_name, "Task worker stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTaskStore;
    use crate::tasks::{ScheduleOptions, TaskDefinition, TaskScheduler};
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        fn task_name(&self) -> &str {
            "noop"
        }

        async fn handle(&self, _task: &TaskRecord) -> crate::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(MemoryTaskStore::new());
        let queues = Arc::new(QueueRegistry::in_memory());
        let scheduler = TaskScheduler::new(store.clone(), queues.clone());
        let record = scheduler
            .schedule(&TaskDefinition::new("noop"), json!({}), ScheduleOptions::new())
            .await
            .unwrap();

        let worker = TaskWorker::new(store.clone(), queues)
            .register(Noop)
            .poll_interval(Duration::from_millis(5));
        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });

        worker.run("default", shutdown).await.unwrap();
        let stored = store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Complete);
        assert_eq!(stored.attempts, 1);
    }

    #[tokio::test]
    async fn test_missing_handler_fails_without_retry() {
        let store = Arc::new(MemoryTaskStore::new());
        let queues = Arc::new(QueueRegistry::in_memory());
        let scheduler = TaskScheduler::new(store.clone(), queues.clone());
        scheduler
            .schedule(&TaskDefinition::new("unknown"), json!({}), ScheduleOptions::new())
            .await
            .unwrap();

        let worker = TaskWorker::new(store, queues);
        let record = worker.process_next("default").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert!(record.last_error.unwrap().contains("no handler"));
    }
}
