//! Redis-backed queue.
//!
//! Enable with the `redis-backend` feature flag. Each queue keeps a job hash,
//! a sorted set of delayed ids scored by ready time, a sorted set of waiting
//! ids ordered by priority then ready time, and sets for the other states.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::queue::{JobOptions, Queue, QueueFactory, QueueJob, QueueStats};
use crate::store::RedisKeyValueStore;
use crate::store::StorageResultExt;

/// One priority step outweighs any ready time in milliseconds before 2286.
const PRIORITY_WEIGHT: f64 = 1e13;
/// Keeps `MAX_PRIORITY * PRIORITY_WEIGHT` plus a ready time below 2^53, where
/// every integer score is exact in an `f64`.
const MAX_PRIORITY: i32 = 800;

fn waiting_score(job: &QueueJob) -> f64 {
    let priority = job.priority.clamp(-MAX_PRIORITY, MAX_PRIORITY) as f64;
    -priority * PRIORITY_WEIGHT + job.ready_at().timestamp_millis() as f64
}

pub struct RedisQueue {
    name: String,
    store: Arc<RedisKeyValueStore>,
    closed: AtomicBool,
}

impl RedisQueue {
    pub fn new(name: impl Into<String>, store: Arc<RedisKeyValueStore>) -> Self {
        Self {
            name: name.into(),
            store,
            closed: AtomicBool::new(false),
        }
    }

    fn key(&self, part: &str) -> String {
        self.store.key(&format!("queue:{}:{}", self.name, part))
    }

    fn ensure_open(&self) -> crate::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(crate::Error::GatewayTimeout(format!(
                "queue '{}' is closed",
                self.name
            )));
        }
        Ok(())
    }

    async fn load(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        job_id: &str,
    ) -> crate::Result<Option<QueueJob>> {
        let raw: Option<String> = redis::cmd("HGET")
            .arg(self.key("jobs"))
            .arg(job_id)
            .query_async(conn)
            .await
            .storage_err()?;
        Ok(raw.map(|r| serde_json::from_str(&r)).transpose()?)
    }

    /// Moves delayed jobs whose ready time has passed into the waiting set.
    async fn promote_due(&self, conn: &mut redis::aio::MultiplexedConnection) -> crate::Result<()> {
        let now = Utc::now().timestamp_millis();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.key("delayed"))
            .arg("-inf")
            .arg(now)
            .query_async(conn)
            .await
            .storage_err()?;

        for id in due {
            let Some(job) = self.load(conn, &id).await? else {
                continue;
            };
            let moved: i64 = redis::cmd("ZREM")
                .arg(self.key("delayed"))
                .arg(&id)
                .query_async(conn)
                .await
                .storage_err()?;
            if moved > 0 {
                redis::cmd("ZADD")
                    .arg(self.key("waiting"))
                    .arg(waiting_score(&job))
                    .arg(&id)
                    .query_async::<()>(conn)
                    .await
                    .storage_err()?;
            }
        }
        Ok(())
    }

    async fn settle(&self, job_id: &str, target: &str, reason: Option<&str>) -> crate::Result<()> {
        let mut conn = self.store.connection().await?;
        let removed: i64 = redis::cmd("SREM")
            .arg(self.key("active"))
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .storage_err()?;
        if removed == 0 {
            return Err(crate::Error::invalid_state(job_id, "active", "not active"));
        }

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("SADD")
            .arg(self.key(target))
            .arg(job_id)
            .ignore();
        if let Some(reason) = reason {
            pipe.cmd("HSET")
                .arg(self.key("failures"))
                .arg(job_id)
                .arg(reason)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.storage_err()?;
        Ok(())
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, name: &str, data: Value, options: JobOptions) -> crate::Result<QueueJob> {
        self.ensure_open()?;
        let mut conn = self.store.connection().await?;

        let id = options
            .job_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (waiting, delayed): (Option<f64>, Option<f64>) = redis::pipe()
            .cmd("ZSCORE")
            .arg(self.key("waiting"))
            .arg(&id)
            .cmd("ZSCORE")
            .arg(self.key("delayed"))
            .arg(&id)
            .query_async(&mut conn)
            .await
            .storage_err()?;
        if waiting.is_some() || delayed.is_some() {
            return Err(crate::Error::BadRequest(format!("job {} is already queued", id)));
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

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.key("jobs"))
            .arg(&job.id)
            .arg(serde_json::to_string(&job)?)
            .ignore();
        for set in ["active", "completed", "failed"] {
            pipe.cmd("SREM").arg(self.key(set)).arg(&job.id).ignore();
        }
        pipe.cmd("HDEL").arg(self.key("failures")).arg(&job.id).ignore();
        if job.delay_ms > 0 {
            pipe.cmd("ZADD")
                .arg(self.key("delayed"))
                .arg(job.ready_at().timestamp_millis())
                .arg(&job.id)
                .ignore();
        } else {
            pipe.cmd("ZADD")
                .arg(self.key("waiting"))
                .arg(waiting_score(&job))
                .arg(&job.id)
                .ignore();
        }
        pipe.query_async::<()>(&mut conn).await.storage_err()?;
        Ok(job)
    }

    async fn remove(&self, job_id: &str) -> crate::Result<bool> {
        let mut conn = self.store.connection().await?;
        let (waiting, delayed): (i64, i64) = redis::pipe()
            .atomic()
            .cmd("ZREM")
            .arg(self.key("waiting"))
            .arg(job_id)
            .cmd("ZREM")
            .arg(self.key("delayed"))
            .arg(job_id)
            .query_async(&mut conn)
            .await
            .storage_err()?;
        if waiting + delayed == 0 {
            return Ok(false);
        }
        redis::cmd("HDEL")
            .arg(self.key("jobs"))
            .arg(job_id)
            .query_async::<()>(&mut conn)
            .await
            .storage_err()?;
        Ok(true)
    }

    async fn get_job(&self, job_id: &str) -> crate::Result<Option<QueueJob>> {
        let mut conn = self.store.connection().await?;
        self.load(&mut conn, job_id).await
    }

    async fn get_stats(&self) -> crate::Result<QueueStats> {
        let mut conn = self.store.connection().await?;
        let (waiting, delayed, active, completed, failed): (u64, u64, u64, u64, u64) =
            redis::pipe()
                .cmd("ZCARD")
                .arg(self.key("waiting"))
                .cmd("ZCARD")
                .arg(self.key("delayed"))
                .cmd("SCARD")
                .arg(self.key("active"))
                .cmd("SCARD")
                .arg(self.key("completed"))
                .cmd("SCARD")
                .arg(self.key("failed"))
                .query_async(&mut conn)
                .await
                .storage_err()?;
        Ok(QueueStats {
            waiting,
            delayed,
            active,
            completed,
            failed,
        })
    }

    async fn close(&self) -> crate::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn reserve(&self) -> crate::Result<Option<QueueJob>> {
        self.ensure_open()?;
        let mut conn = self.store.connection().await?;
        self.promote_due(&mut conn).await?;

        let popped: Vec<String> = redis::cmd("ZPOPMIN")
            .arg(self.key("waiting"))
            .arg(1)
            .query_async(&mut conn)
            .await
            .storage_err()?;
        let Some(id) = popped.into_iter().next() else {
            return Ok(None);
        };

        redis::cmd("SADD")
            .arg(self.key("active"))
            .arg(&id)
            .query_async::<()>(&mut conn)
            .await
            .storage_err()?;
        self.load(&mut conn, &id).await
    }

    async fn complete(&self, job_id: &str) -> crate::Result<()> {
        self.settle(job_id, "completed", None).await
    }

    async fn fail(&self, job_id: &str, reason: &str) -> crate::Result<()> {
        self.settle(job_id, "failed", Some(reason)).await
    }
}

/// Creates [`RedisQueue`]s sharing one connection pool.
pub struct RedisQueueFactory {
    store: Arc<RedisKeyValueStore>,
}

impl RedisQueueFactory {
    pub fn new(store: Arc<RedisKeyValueStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl QueueFactory for RedisQueueFactory {
    async fn create(&self, name: &str) -> crate::Result<Arc<dyn Queue>> {
        Ok(Arc::new(RedisQueue::new(name, Arc::clone(&self.store))))
    }
}
