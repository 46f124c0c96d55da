//! Asynchronous work: durable task records, named priority queues, the
//! scheduler that writes both, and the worker that drains them.

mod backoff;
mod definition;
mod queue;
mod record;
#[cfg(feature = "redis-backend")]
pub mod redis_queue;
mod registry;
mod resume;
mod scheduler;
mod worker;

pub use backoff::ExponentialBackoff;
pub use definition::{DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE, TaskDefinition};
pub use queue::{
    DEFAULT_SETTLED_RETENTION, JobOptions, MemoryQueue, MemoryQueueFactory, Queue, QueueFactory,
    QueueJob, QueueStats,
};
pub use record::{TaskPatch, TaskRecord, TaskStatus, TaskUpdate};
#[cfg(feature = "redis-backend")]
pub use redis_queue::{RedisQueue, RedisQueueFactory};
pub use registry::QueueRegistry;
pub use resume::{RESUME_AGENT_TASK, ResumeAgentHandler, ResumeAgentPayload};
pub use scheduler::{ScheduleOptions, TaskScheduler};
pub use worker::{TaskHandler, TaskWorker};
