//! Task Scheduler Tests
//!
//! Scheduling, bulk updates, priority dispatch, worker retries and the
//! built-in agent resume task.
//!
//! Run: cargo nextest run --test task_scheduler_tests

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use agent_orchestrator::store::{MemoryTaskStore, TaskStore};
use agent_orchestrator::tasks::{
    ExponentialBackoff, QueueRegistry, ScheduleOptions, TaskDefinition, TaskHandler, TaskPatch,
    TaskRecord, TaskScheduler, TaskStatus, TaskUpdate, TaskWorker,
};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
#[allow(dead_code)]
struct EmailPayload {
    to: String,
    subject: String,
}

fn email_task() -> TaskDefinition {
    TaskDefinition::typed::<EmailPayload>("email.send")
        .on_queue("email")
        .with_max_attempts(3)
}

struct Setup {
    store: Arc<MemoryTaskStore>,
    queues: Arc<QueueRegistry>,
    scheduler: TaskScheduler,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn setup() -> Setup {
    init_tracing();
    let store = Arc::new(MemoryTaskStore::new());
    let queues = Arc::new(QueueRegistry::in_memory());
    let scheduler = TaskScheduler::new(store.clone(), queues.clone());
    Setup {
        store,
        queues,
        scheduler,
    }
}

/// Fails with a retryable error until `succeed_on` attempts have been made.
struct FlakyHandler {
    name: &'static str,
    calls: Arc<AtomicU32>,
    succeed_on: u32,
}

#[async_trait]
impl TaskHandler for FlakyHandler {
    fn task_name(&self) -> &str {
        self.name
    }

    async fn handle(&self, task: &TaskRecord) -> agent_orchestrator::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(task.attempts, call);
        if call >= self.succeed_on {
            Ok(())
        } else {
            Err(agent_orchestrator::Error::GatewayTimeout("smtp down".into()))
        }
    }
}

fn no_wait() -> ExponentialBackoff {
    ExponentialBackoff::new(Duration::ZERO, Duration::ZERO, 2.0).with_jitter(0.0)
}

// =============================================================================
// Scheduling
// =============================================================================

mod schedule_tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_payload_creates_no_record() {
        let s = setup();
        let err = s
            .scheduler
            .schedule(&email_task(), json!({"to": "a@b.c"}), ScheduleOptions::new())
            .await
            .unwrap_err();

        assert_eq!(err.kind(), agent_orchestrator::ErrorKind::BadRequest);
        assert_eq!(s.store.count().await, 0);
        assert!(s.queues.is_empty());
    }

    #[tokio::test]
    async fn test_delayed_schedule() {
        let s = setup();
        let before = Utc::now();
        let record = s
            .scheduler
            .schedule(
                &email_task(),
                json!({"to": "a@b.c", "subject": "hi"}),
                ScheduleOptions::new().delay_ms(5000),
            )
            .await
            .unwrap();

        assert_eq!(record.status, TaskStatus::Delayed);
        assert_eq!(record.attempts, 0);
        assert_eq!(record.max_attempts, 3);
        let delay_until = record.delay_until.unwrap();
        let offset = (delay_until - before).num_milliseconds();
        assert!((5000..6000).contains(&offset), "offset {offset}");

        let job = s.scheduler.get_job(&record).await.unwrap().unwrap();
        assert!(job.delay_ms <= 5000);
        assert!(job.delay_ms > 0);

        let stats = s.scheduler.stats("email").await.unwrap();
        assert_eq!(stats.delayed, 1);
        assert_eq!(stats.waiting, 0);

        let stored = s.store.get(&record.id).await.unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[tokio::test]
    async fn test_queue_client_created_once_per_name() {
        let s = setup();
        let payload = json!({"to": "a@b.c", "subject": "hi"});
        for _ in 0..3 {
            s.scheduler
                .schedule(&email_task(), payload.clone(), ScheduleOptions::new())
                .await
                .unwrap();
        }
        s.scheduler
            .schedule(
                &TaskDefinition::new("report").on_queue("reports"),
                json!({}),
                ScheduleOptions::new(),
            )
            .await
            .unwrap();

        assert_eq!(s.queues.names(), vec!["email", "reports"]);
        assert_eq!(s.scheduler.stats("email").await.unwrap().waiting, 3);
    }

    #[tokio::test]
    async fn test_close_drops_cached_queues() {
        let s = setup();
        let payload = json!({"to": "a@b.c", "subject": "hi"});
        s.scheduler
            .schedule(&email_task(), payload.clone(), ScheduleOptions::new())
            .await
            .unwrap();
        s.scheduler.close().await;
        assert!(s.queues.is_empty());
    }
}

// =============================================================================
// Bulk updates
// =============================================================================

mod bulk_update_tests {
    use super::*;
    use agent_orchestrator::TaskId;

    #[tokio::test]
    async fn test_bulk_update_counts_matched_rows() {
        let s = setup();
        let mut ids = Vec::new();
        for n in 0..3 {
            let record = s
                .scheduler
                .schedule(
                    &TaskDefinition::new("report"),
                    json!({"n": n}),
                    ScheduleOptions::new(),
                )
                .await
                .unwrap();
            ids.push(record.id);
        }

        let mut updates: Vec<TaskUpdate> = ids
            .iter()
            .map(|id| TaskUpdate::new(*id, TaskPatch::new().priority(9)))
            .collect();
        updates.push(TaskUpdate::new(TaskId::new(), TaskPatch::new().priority(9)));

        let matched = s.scheduler.bulk_update(&updates).await.unwrap();
        assert_eq!(matched, 3);
        for id in &ids {
            let record = s.scheduler.get(id).await.unwrap().unwrap();
            assert_eq!(record.priority, 9);
            assert_eq!(record.status, TaskStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_list_for_user_scopes_records() {
        let s = setup();
        let def = TaskDefinition::new("report");
        s.scheduler
            .schedule(&def, json!({}), ScheduleOptions::new().user("alice"))
            .await
            .unwrap();
        s.scheduler
            .schedule(&def, json!({}), ScheduleOptions::new().user("bob"))
            .await
            .unwrap();

        let alice = s.scheduler.list_for_user("alice").await.unwrap();
        assert_eq!(alice.len(), 1);
        assert_eq!(alice[0].user_id.as_deref(), Some("alice"));
    }
}

// =============================================================================
// Worker
// =============================================================================

mod worker_tests {
    use super::*;

    #[tokio::test]
    async fn test_higher_priority_runs_first() {
        let s = setup();
        let def = TaskDefinition::new("report");
        let low = s
            .scheduler
            .schedule(&def, json!({"n": "low"}), ScheduleOptions::new())
            .await
            .unwrap();
        let high = s
            .scheduler
            .schedule(&def, json!({"n": "high"}), ScheduleOptions::new().priority(10))
            .await
            .unwrap();

        let worker = TaskWorker::new(s.store.clone(), s.queues.clone()).register(FlakyHandler {
            name: "report",
            calls: Arc::new(AtomicU32::new(0)),
            succeed_on: 1,
        });
        let first = worker.process_next("default").await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(first.status, TaskStatus::Complete);

        let second = worker.process_next("default").await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
        assert!(worker.process_next("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_task_not_ready() {
        let s = setup();
        s.scheduler
            .schedule(
                &TaskDefinition::new("report"),
                json!({}),
                ScheduleOptions::new().delay(Duration::from_secs(60)),
            )
            .await
            .unwrap();

        let worker = TaskWorker::new(s.store.clone(), s.queues.clone());
        assert!(worker.process_next("default").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retryable_failure_is_retried_until_success() {
        let s = setup();
        let metrics = Arc::new(agent_orchestrator::RuntimeMetrics::new());
        let record = s
            .scheduler
            .schedule(
                &email_task(),
                json!({"to": "a@b.c", "subject": "hi"}),
                ScheduleOptions::new(),
            )
            .await
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let worker = TaskWorker::new(s.store.clone(), s.queues.clone())
            .register(FlakyHandler {
                name: "email.send",
                calls: calls.clone(),
                succeed_on: 2,
            })
            .backoff(no_wait())
            .with_metrics(metrics.clone());

        let first = worker.process_next("email").await.unwrap().unwrap();
        assert_eq!(first.status, TaskStatus::Delayed);
        assert_eq!(first.attempts, 1);
        assert!(first.last_error.as_deref().unwrap().contains("smtp down"));

        let second = worker.process_next("email").await.unwrap().unwrap();
        assert_eq!(second.id, record.id);
        assert_eq!(second.status, TaskStatus::Complete);
        assert_eq!(second.attempts, 2);
        assert!(second.last_error.is_none());

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(metrics.task_attempts.get(), 2);
        assert_eq!(metrics.task_failures.get(), 0);
        let stats = s.scheduler.stats("email").await.unwrap();
        assert_eq!((stats.completed, stats.failed), (1, 0));
    }

    #[tokio::test]
    async fn test_attempts_exhausted_marks_failed() {
        let s = setup();
        s.scheduler
            .schedule(
                &email_task(),
                json!({"to": "a@b.c", "subject": "hi"}),
                ScheduleOptions::new(),
            )
            .await
            .unwrap();

        let worker = TaskWorker::new(s.store.clone(), s.queues.clone())
            .register(FlakyHandler {
                name: "email.send",
                calls: Arc::new(AtomicU32::new(0)),
                succeed_on: u32::MAX,
            })
            .backoff(no_wait());

        let mut last = None;
        while let Some(record) = worker.process_next("email").await.unwrap() {
            last = Some(record);
        }
        let last = last.unwrap();
        assert_eq!(last.status, TaskStatus::Failed);
        assert_eq!(last.attempts, 3);
        assert_eq!(s.scheduler.stats("email").await.unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_bad_request_is_not_retried() {
        struct Rejecting;

        #[async_trait]
        impl TaskHandler for Rejecting {
            fn task_name(&self) -> &str {
                "report"
            }

            async fn handle(&self, _task: &TaskRecord) -> agent_orchestrator::Result<()> {
                Err(agent_orchestrator::Error::BadRequest("malformed".into()))
            }
        }

        let s = setup();
        s.scheduler
            .schedule(&TaskDefinition::new("report"), json!({}), ScheduleOptions::new())
            .await
            .unwrap();
        let worker = TaskWorker::new(s.store.clone(), s.queues.clone()).register(Rejecting);

        let record = worker.process_next("default").await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert!(worker.process_next("default").await.unwrap().is_none());
    }
}

// =============================================================================
// Agent resume task
// =============================================================================

mod resume_task_tests {
    use super::*;
    use agent_orchestrator::manifest::{AgentManifest, InMemoryManifestRegistry, StopCondition};
    use agent_orchestrator::tasks::{ResumeAgentHandler, ResumeAgentPayload};
    use agent_orchestrator::testing::{ApprovalGatedTool, ScriptedModel};
    use agent_orchestrator::{
        AgentRuntime, AgentStatus, ManifestKey, ModelResponse, ResolvedSuspension, RunOptions,
    };

    #[tokio::test]
    async fn test_scheduled_resume_completes_run() {
        let manifests: InMemoryManifestRegistry = [AgentManifest::new("ops", "1")
            .with_tool("deploy")
            .stop_when(StopCondition::step_count(2))]
        .into_iter()
        .collect();
        let model = ScriptedModel::new().script(
            "ops",
            [ModelResponse::tool_call("c1", "deploy", json!({}))],
        );
        let runtime = AgentRuntime::builder()
            .manifests(manifests)
            .model(model)
            .tool(ApprovalGatedTool::new("deploy", "ok"))
            .build()
            .unwrap();

        let suspended = runtime
            .run_agent(&ManifestKey::new("ops", "1"), "release", RunOptions::default())
            .await
            .unwrap();
        let stack = suspended.suspension().unwrap();
        let approval = stack.leaf.suspensions[0].approval_id().clone();

        let s = setup();
        let payload = ResumeAgentPayload::new(
            suspended.state_id(),
            vec![ResolvedSuspension::approve(approval)],
        );
        let record = s
            .scheduler
            .schedule(
                &ResumeAgentHandler::definition(),
                serde_json::to_value(&payload).unwrap(),
                ScheduleOptions::new(),
            )
            .await
            .unwrap();
        assert_eq!(record.queue_name, "agents");

        let worker = TaskWorker::new(s.store.clone(), s.queues.clone())
            .register(ResumeAgentHandler::new(runtime.clone()));
        let processed = worker.process_next("agents").await.unwrap().unwrap();
        assert_eq!(processed.status, TaskStatus::Complete);

        let state = runtime.state(suspended.state_id()).await.unwrap().unwrap();
        assert_eq!(state.status, AgentStatus::Complete);
    }

    #[tokio::test]
    async fn test_malformed_resume_payload_is_rejected_at_schedule() {
        let s = setup();
        let err = s
            .scheduler
            .schedule(
                &ResumeAgentHandler::definition(),
                json!({"state_id": "nope"}),
                ScheduleOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_bad_request());
        assert_eq!(s.store.count().await, 0);
    }
}
