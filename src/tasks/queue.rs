//! Broker-neutral queue contract and the in-process implementation.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

/// Handle of an enqueued job; the only queue object the scheduler hands out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: String,
    pub name: String,
    pub data: Value,
    pub attempts_made: u32,
    pub priority: i32,
    pub timestamp: DateTime<Utc>,
    /// Delay requested at enqueue time.
    pub delay_ms: u64,
}

impl QueueJob {
    pub fn ready_at(&self) -> DateTime<Utc> {
        self.timestamp + chrono::Duration::milliseconds(self.delay_ms.min(i64::MAX as u64) as i64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// Reusing the id of a finished or active job replaces it.
    pub job_id: Option<String>,
    pub priority: i32,
    pub delay: Duration,
    pub attempts_made: u32,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn attempts_made(mut self, attempts: u32) -> Self {
        self.attempts_made = attempts;
        self
    }
}

/// Job counts by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Producer and consumer surface of one named queue.
#[async_trait]
pub trait Queue: Send + Sync {
    fn name(&self) -> &str;

    async fn enqueue(&self, name: &str, data: Value, options: JobOptions) -> crate::Result<QueueJob>;

    /// Drops a job that has not started yet. Returns whether one was removed.
    async fn remove(&self, job_id: &str) -> crate::Result<bool>;

    async fn get_job(&self, job_id: &str) -> crate::Result<Option<QueueJob>>;

    async fn get_stats(&self) -> crate::Result<QueueStats>;

    async fn close(&self) -> crate::Result<()>;

    /// Takes the highest priority ready job and marks it active.
    async fn reserve(&self) -> crate::Result<Option<QueueJob>>;

    async fn complete(&self, job_id: &str) -> crate::Result<()>;

    async fn fail(&self, job_id: &str, reason: &str) -> crate::Result<()>;
}

/// Creates queue clients by name.
#[async_trait]
pub trait QueueFactory: Send + Sync {
    async fn create(&self, name: &str) -> crate::Result<Arc<dyn Queue>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Queued,
    Active,
    Completed,
    Failed,
}

#[derive(Debug)]
struct Entry {
    job: QueueJob,
    ready_at: DateTime<Utc>,
    seq: u64,
    state: JobState,
    failure: Option<String>,
}

/// Settled jobs a [`MemoryQueue`] keeps for lookups before dropping the oldest.
pub const DEFAULT_SETTLED_RETENTION: usize = 1_000;

#[derive(Debug, Default)]
struct QueueState {
    entries: Vec<Entry>,
    next_seq: u64,
    closed: bool,
    settled: usize,
    dropped_completed: u64,
    dropped_failed: u64,
}

impl QueueState {
    fn position(&self, job_id: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.job.id == job_id)
    }

    fn next_ready(&self, now: DateTime<Utc>) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.state == JobState::Queued && e.ready_at <= now)
            .max_by(|(_, a), (_, b)| {
                a.job
                    .priority
                    .cmp(&b.job.priority)
                    .then_with(|| b.ready_at.cmp(&a.ready_at))
                    .then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)
    }

    /// Drops the oldest settled entries beyond `keep`; stats still count them.
    fn prune_settled(&mut self, keep: usize) {
        while self.settled > keep {
            let Some(index) = self
                .entries
                .iter()
                .position(|e| matches!(e.state, JobState::Completed | JobState::Failed))
            else {
                break;
            };
            match self.entries.remove(index).state {
                JobState::Completed => self.dropped_completed += 1,
                _ => self.dropped_failed += 1,
            }
            self.settled -= 1;
        }
    }

    fn remove_entry(&mut self, index: usize) -> Entry {
        let entry = self.entries.remove(index);
        if matches!(entry.state, JobState::Completed | JobState::Failed) {
            self.settled -= 1;
        }
        entry
    }
}

/// Process-local queue; jobs are lost with the process.
///
/// Only the most recent settled jobs stay visible to `get_job` and `failure`.
#[derive(Clone)]
pub struct MemoryQueue {
    name: String,
    state: Arc<RwLock<QueueState>>,
    retention: usize,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_retention(name, DEFAULT_SETTLED_RETENTION)
    }

    pub fn with_retention(name: impl Into<String>, retention: usize) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(RwLock::new(QueueState::default())),
            retention,
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    /// Failure reason recorded for a failed job.
    pub async fn failure(&self, job_id: &str) -> Option<String> {
        let state = self.state.read().await;
        state
            .position(job_id)
            .and_then(|i| state.entries[i].failure.clone())
    }

    fn closed_error(&self) -> crate::Error {
        crate::Error::GatewayTimeout(format!("queue '{}' is closed", self.name))
    }

    async fn finish(&self, job_id: &str, outcome: JobState, failure: Option<String>) -> crate::Result<()> {
        let mut state = self.state.write().await;
        let index = state
            .position(job_id)
            .ok_or_else(|| crate::Error::not_found("job", job_id))?;
        let entry = &mut state.entries[index];
        if entry.state != JobState::Active {
            return Err(crate::Error::invalid_state(job_id, "active", format!("{:?}", entry.state).to_lowercase()));
        }
        entry.state = outcome;
        entry.failure = failure;
        state.settled += 1;
        state.prune_settled(self.retention);
        Ok(())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, name: &str, data: Value, options: JobOptions) -> crate::Result<QueueJob> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(self.closed_error());
        }

        let id = options
            .job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        if let Some(index) = state.position(&id) {
            if state.entries[index].state == JobState::Queued {
                return Err(crate::Error::BadRequest(format!("job {} is already queued", id)));
            }
            state.remove_entry(index);
        }

        let job = QueueJob {
            id,
            name: name.to_string(),
            data,
            attempts_made: options.attempts_made,
            priority: options.priority,
            timestamp: Utc::now(),
            delay_ms: options.delay.as_millis() as u64,
        };
        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.push(Entry {
            ready_at: job.ready_at(),
            job: job.clone(),
            seq,
            state: JobState::Queued,
            failure: None,
        });
        Ok(job)
    }

    async fn remove(&self, job_id: &str) -> crate::Result<bool> {
        let mut state = self.state.write().await;
        match state.position(job_id) {
            Some(index) if state.entries[index].state == JobState::Queued => {
                state.remove_entry(index);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_job(&self, job_id: &str) -> crate::Result<Option<QueueJob>> {
        let state = self.state.read().await;
        Ok(state.position(job_id).map(|i| state.entries[i].job.clone()))
    }

    async fn get_stats(&self) -> crate::Result<QueueStats> {
        let state = self.state.read().await;
        let now = Utc::now();
        let mut stats = QueueStats {
            completed: state.dropped_completed,
            failed: state.dropped_failed,
            ..QueueStats::default()
        };
        for entry in &state.entries {
            match entry.state {
                JobState::Queued if entry.ready_at > now => stats.delayed += 1,
                JobState::Queued => stats.waiting += 1,
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn close(&self) -> crate::Result<()> {
        self.state.write().await.closed = true;
        Ok(())
    }

    async fn reserve(&self) -> crate::Result<Option<QueueJob>> {
        let mut state = self.state.write().await;
        if state.closed {
            return Err(self.closed_error());
        }
        let Some(index) = state.next_ready(Utc::now()) else {
            return Ok(None);
        };
        let entry = &mut state.entries[index];
        entry.state = JobState::Active;
        Ok(Some(entry.job.clone()))
    }

    async fn complete(&self, job_id: &str) -> crate::Result<()> {
        self.finish(job_id, JobState::Completed, None).await
    }

    async fn fail(&self, job_id: &str, reason: &str) -> crate::Result<()> {
        self.finish(job_id, JobState::Failed, Some(reason.to_string()))
            .await
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryQueueFactory;

#[async_trait]
impl QueueFactory for MemoryQueueFactory {
    async fn create(&self, name: &str) -> crate::Result<Arc<dyn Queue>> {
        Ok(Arc::new(MemoryQueue::new(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = MemoryQueue::new("q");
        queue.enqueue("t", json!(1), JobOptions::new().job_id("low")).await.unwrap();
        queue.enqueue("t", json!(2), JobOptions::new().job_id("first")).await.unwrap();
        queue
            .enqueue("t", json!(3), JobOptions::new().job_id("high").priority(5))
            .await
            .unwrap();

        let order: Vec<String> = [
            queue.reserve().await.unwrap().unwrap().id,
            queue.reserve().await.unwrap().unwrap().id,
            queue.reserve().await.unwrap().unwrap().id,
        ]
        .into();
        assert_eq!(order, vec!["high", "low", "first"]);
        assert!(queue.reserve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_jobs_wait() {
        let queue = MemoryQueue::new("q");
        let job = queue
            .enqueue("t", json!({}), JobOptions::new().delay(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(job.delay_ms, 60_000);

        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.waiting, 0);
        assert!(queue.reserve().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_and_lifecycle() {
        let queue = MemoryQueue::new("q");
        queue.enqueue("t", json!({}), JobOptions::new().job_id("a")).await.unwrap();
        queue.enqueue("t", json!({}), JobOptions::new().job_id("b")).await.unwrap();
        assert!(queue.remove("a").await.unwrap());
        assert!(!queue.remove("a").await.unwrap());
        assert!(queue.get_job("a").await.unwrap().is_none());

        let job = queue.reserve().await.unwrap().unwrap();
        assert!(!queue.remove(&job.id).await.unwrap());
        queue.fail(&job.id, "boom").await.unwrap();
        assert_eq!(queue.failure("b").await.as_deref(), Some("boom"));
        assert_eq!(queue.get_stats().await.unwrap().failed, 1);

        // retry replaces the failed entry
        queue
            .enqueue("t", json!({}), JobOptions::new().job_id("b").attempts_made(1))
            .await
            .unwrap();
        let stats = queue.get_stats().await.unwrap();
        assert_eq!((stats.waiting, stats.failed), (1, 0));
        assert!(queue.enqueue("t", json!({}), JobOptions::new().job_id("b")).await.is_err());
    }

    #[tokio::test]
    async fn test_settled_jobs_beyond_retention_are_dropped_but_counted() {
        let queue = MemoryQueue::with_retention("q", 2);
        for id in ["a", "b", "c", "d"] {
            queue.enqueue("t", json!({}), JobOptions::new().job_id(id)).await.unwrap();
        }
        for id in ["a", "b", "c"] {
            let job = queue.reserve().await.unwrap().unwrap();
            assert_eq!(job.id, id);
            if id == "b" {
                queue.fail(id, "boom").await.unwrap();
            } else {
                queue.complete(id).await.unwrap();
            }
        }

        assert!(queue.get_job("a").await.unwrap().is_none());
        assert_eq!(queue.failure("b").await.as_deref(), Some("boom"));
        assert!(queue.get_job("c").await.unwrap().is_some());
        assert!(queue.get_job("d").await.unwrap().is_some());

        let stats = queue.get_stats().await.unwrap();
        assert_eq!((stats.waiting, stats.completed, stats.failed), (1, 2, 1));

        let job = queue.reserve().await.unwrap().unwrap();
        queue.complete(&job.id).await.unwrap();
        assert!(queue.failure("b").await.is_none());
        let stats = queue.get_stats().await.unwrap();
        assert_eq!((stats.waiting, stats.completed, stats.failed), (0, 3, 1));
    }

    #[tokio::test]
    async fn test_closed_queue_rejects_work() {
        let queue = MemoryQueue::new("q");
        queue.close().await.unwrap();
        assert!(queue.is_closed().await);
        let err = queue.enqueue("t", json!({}), JobOptions::new()).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
