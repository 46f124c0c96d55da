//! Suspension Tests
//!
//! Human-in-the-loop approval: suspend/resume round trips, nested sub-agent
//! stacks, resolution validation, suspended cancellation, the run lock and
//! failed resumes.
//!
//! Run: cargo nextest run --test suspension_tests

use std::sync::Arc;
use std::time::Duration;

use agent_orchestrator::manifest::{
    AgentManifest, InMemoryManifestRegistry, ManifestKey, OnTextOnly, StopCondition, SubAgentRef,
};
use agent_orchestrator::testing::{ApprovalGatedTool, RecordingHook, RecordingStore, ScriptedModel};
use agent_orchestrator::{
    AgentRunResult, AgentRuntime, AgentRuntimeBuilder, AgentStatus, ApprovalId, Hook, HookInput,
    HookRegistry, LifecycleEvent, ModelResponse, ResumeOptions, RunOptions, RuntimeConfig,
    SuspensionStack,
};
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;

fn key(id: &str) -> ManifestKey {
    ManifestKey::new(id, "1")
}

struct Fixture {
    runtime: AgentRuntime,
    model: ScriptedModel,
    deploy: ApprovalGatedTool,
    store: Arc<RecordingStore>,
    hooks: Arc<HookRegistry>,
}

fn fixture(manifests: Vec<AgentManifest>, model: ScriptedModel) -> Fixture {
    fixture_with(manifests, model, |builder, _| builder)
}

/// Like [`fixture`], with extra builder settings applied last.
fn fixture_with(
    manifests: Vec<AgentManifest>,
    model: ScriptedModel,
    configure: impl FnOnce(AgentRuntimeBuilder, &Arc<RecordingStore>) -> AgentRuntimeBuilder,
) -> Fixture {
    let deploy = ApprovalGatedTool::new("deploy", "deployed v2");
    let store = Arc::new(RecordingStore::new());
    let hooks = Arc::new(HookRegistry::new());
    let builder = AgentRuntime::builder()
        .manifests(manifests.into_iter().collect::<InMemoryManifestRegistry>())
        .model(model.clone())
        .tool(deploy.clone())
        .store(store.clone())
        .hooks(hooks.clone())
        .config(RuntimeConfig::default().with_poll_interval(Duration::ZERO));
    let runtime = configure(builder, &store).build().unwrap();
    Fixture {
        runtime,
        model,
        deploy,
        store,
        hooks,
    }
}

fn ops_manifest() -> AgentManifest {
    AgentManifest::new("ops", "1")
        .with_tool("deploy")
        .stop_when(StopCondition::step_count(2))
}

/// Single agent that asks to deploy, then reports.
fn ops_fixture() -> Fixture {
    let manifest = ops_manifest();
    let model = ScriptedModel::new().script(
        "ops",
        [
            ModelResponse::tool_call("c1", "deploy", json!({"version": "v2"})),
            ModelResponse::text("rollout finished"),
        ],
    );
    fixture(vec![manifest], model)
}

/// root -> mid -> leaf, where leaf asks to deploy.
fn nested_fixture() -> Fixture {
    let root = AgentManifest::new("root", "1")
        .on_text_only(OnTextOnly::Stop)
        .with_sub_agent(SubAgentRef::new("mid", "1"));
    let mid = AgentManifest::new("mid", "1")
        .on_text_only(OnTextOnly::Stop)
        .with_sub_agent(SubAgentRef::new("leaf", "1"));
    let leaf = AgentManifest::new("leaf", "1")
        .on_text_only(OnTextOnly::Stop)
        .with_tool("deploy");

    let model = ScriptedModel::new()
        .script(
            "root",
            [
                ModelResponse::tool_call("r1", "mid", json!({"input": "ship it"})),
                ModelResponse::text("root done"),
            ],
        )
        .script(
            "mid",
            [
                ModelResponse::tool_call("m1", "leaf", json!({"input": "deploy v2"})),
                ModelResponse::text("mid done"),
            ],
        )
        .script(
            "leaf",
            [
                ModelResponse::tool_call("l1", "deploy", json!({"version": "v2"})),
                ModelResponse::text("leaf done"),
            ],
        );
    fixture(vec![root, mid, leaf], model)
}

fn only_approval(stack: &SuspensionStack) -> ApprovalId {
    assert_eq!(stack.leaf.suspensions.len(), 1);
    stack.leaf.suspensions[0].approval_id().clone()
}

/// Records the child's persisted status at each `SubAgent*` hook.
#[derive(Clone)]
struct ChildStatusHook {
    runtime: AgentRuntime,
    seen: Arc<Mutex<Vec<(LifecycleEvent, Option<AgentStatus>)>>>,
}

impl ChildStatusHook {
    fn new(runtime: AgentRuntime) -> Self {
        Self {
            runtime,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn seen(&self) -> Vec<(LifecycleEvent, Option<AgentStatus>)> {
        self.seen.lock().await.clone()
    }
}

#[async_trait]
impl Hook for ChildStatusHook {
    fn name(&self) -> &str {
        "child-status"
    }

    fn events(&self) -> &[LifecycleEvent] {
        &[
            LifecycleEvent::SubAgentComplete,
            LifecycleEvent::SubAgentSuspend,
            LifecycleEvent::SubAgentCancelled,
        ]
    }

    async fn execute(&self, input: HookInput) -> agent_orchestrator::Result<()> {
        let Some(child) = &input.sub_agent else {
            return Ok(());
        };
        let status = self.runtime.state(child.state_id).await?.map(|s| s.status);
        self.seen.lock().await.push((input.event, status));
        Ok(())
    }
}

// =============================================================================
// Round trip
// =============================================================================

mod round_trip_tests {
    use super::*;
    use agent_orchestrator::{Message, ResolvedSuspension};

    #[tokio::test]
    async fn test_suspend_before_tool_executes() {
        let fx = ops_fixture();
        let result = fx
            .runtime
            .run_agent(&key("ops"), "release", RunOptions::default())
            .await
            .unwrap();

        let stack = result.suspension().expect("suspended");
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.leaf.state_id, result.state_id());
        assert_eq!(fx.deploy.calls(), 0);

        let state = fx.runtime.state(result.state_id()).await.unwrap().unwrap();
        assert_eq!(state.status, AgentStatus::Suspended);
        assert_eq!(state.step_number, 1);
        assert_eq!(state.suspension.as_ref(), Some(stack));
    }

    #[tokio::test]
    async fn test_resume_appends_one_response_and_continues_at_next_step() {
        let fx = ops_fixture();
        let recorder = RecordingHook::new("rec");
        fx.hooks.register(&key("ops"), recorder.clone());

        let suspended = fx
            .runtime
            .run_agent(&key("ops"), "release", RunOptions::default())
            .await
            .unwrap();
        let state_id = suspended.state_id();
        let approval = only_approval(suspended.suspension().unwrap());
        let before = fx.runtime.state(state_id).await.unwrap().unwrap().messages;

        let result = fx
            .runtime
            .resume_agent(
                state_id,
                vec![ResolvedSuspension::approve(approval.clone())],
                ResumeOptions::default(),
            )
            .await
            .unwrap();

        let output = result.output().expect("complete");
        assert_eq!(output.text, "rollout finished");
        assert_eq!(output.steps, 2);
        assert_eq!(fx.deploy.calls(), 1);
        // step 1 is not replayed
        assert_eq!(fx.model.call_count().await, 2);

        let after = fx.runtime.state(state_id).await.unwrap().unwrap();
        assert_eq!(&after.messages[..before.len()], &before[..]);
        assert_eq!(
            after.messages[before.len()],
            Message::approval_response(approval, true, None)
        );
        let responses = after
            .messages
            .iter()
            .filter(|m| m.approval_responses().next().is_some())
            .count();
        assert_eq!(responses, 1);

        let step_two = &fx.model.requests().await[1];
        assert_eq!(step_two.messages.len(), before.len() + 2);
        assert_eq!(after.steps[0].tool_results[0].content, "deployed v2");

        assert_eq!(
            recorder.recorded().await,
            vec![
                LifecycleEvent::AgentStart,
                LifecycleEvent::AgentSuspend,
                LifecycleEvent::AgentResume,
                LifecycleEvent::AgentComplete,
            ]
        );
    }

    #[tokio::test]
    async fn test_denied_call_gets_reason_as_error_result() {
        let fx = ops_fixture();
        let suspended = fx
            .runtime
            .run_agent(&key("ops"), "release", RunOptions::default())
            .await
            .unwrap();
        let approval = only_approval(suspended.suspension().unwrap());

        let result = fx
            .runtime
            .resume_agent(
                suspended.state_id(),
                vec![ResolvedSuspension::deny(approval, "change freeze")],
                ResumeOptions::default(),
            )
            .await
            .unwrap();
        assert!(result.is_complete());
        assert_eq!(fx.deploy.calls(), 0);

        let state = fx.runtime.state(result.state_id()).await.unwrap().unwrap();
        let denied = &state.steps[0].tool_results[0];
        assert!(denied.is_error);
        assert_eq!(denied.content, "Tool execution denied: change freeze");
    }

    #[tokio::test]
    async fn test_resume_completed_state_is_rejected_without_mutation() {
        let fx = ops_fixture();
        let suspended = fx
            .runtime
            .run_agent(&key("ops"), "release", RunOptions::default())
            .await
            .unwrap();
        let approval = only_approval(suspended.suspension().unwrap());
        fx.runtime
            .resume_agent(
                suspended.state_id(),
                vec![ResolvedSuspension::approve(approval.clone())],
                ResumeOptions::default(),
            )
            .await
            .unwrap();
        let complete = fx.runtime.state(suspended.state_id()).await.unwrap().unwrap();

        let err = fx
            .runtime
            .resume_agent(
                suspended.state_id(),
                vec![ResolvedSuspension::approve(approval)],
                ResumeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, agent_orchestrator::Error::InvalidState { .. }));

        let unchanged = fx.runtime.state(suspended.state_id()).await.unwrap().unwrap();
        assert_eq!(unchanged, complete);
        assert_eq!(fx.deploy.calls(), 1);
    }
}

// =============================================================================
// Resolution validation
// =============================================================================

mod validation_tests {
    use super::*;
    use agent_orchestrator::{Error, ErrorKind, ResolvedSuspension, StateId};

    #[tokio::test]
    async fn test_unknown_approval_id_is_validation_error() {
        let fx = ops_fixture();
        let suspended = fx
            .runtime
            .run_agent(&key("ops"), "release", RunOptions::default())
            .await
            .unwrap();
        let approval = only_approval(suspended.suspension().unwrap());

        let err = fx
            .runtime
            .resume_agent(
                suspended.state_id(),
                vec![
                    ResolvedSuspension::approve(approval),
                    ResolvedSuspension::approve("not-pending"),
                ],
                ResumeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let state = fx.runtime.state(suspended.state_id()).await.unwrap().unwrap();
        assert_eq!(state.status, AgentStatus::Suspended);
    }

    #[tokio::test]
    async fn test_missing_resolution_is_validation_error() {
        let fx = ops_fixture();
        let suspended = fx
            .runtime
            .run_agent(&key("ops"), "release", RunOptions::default())
            .await
            .unwrap();

        let err = fx
            .runtime
            .resume_agent(suspended.state_id(), Vec::new(), ResumeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(fx.model.call_count().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_state_is_not_found() {
        let fx = ops_fixture();
        let err = fx
            .runtime
            .resume_agent(StateId::new(), Vec::new(), ResumeOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_held_run_lock_rejects_resume() {
        use agent_orchestrator::KeyValueStore;

        let fx = ops_fixture();
        let suspended = fx
            .runtime
            .run_agent(&key("ops"), "release", RunOptions::default())
            .await
            .unwrap();
        let approval = only_approval(suspended.suspension().unwrap());

        let lock = format!("agent:lock:{}", suspended.state_id());
        fx.store
            .set(&lock, "another-worker", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        let err = fx
            .runtime
            .resume_agent(
                suspended.state_id(),
                vec![ResolvedSuspension::approve(approval.clone())],
                ResumeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("resume in progress"));

        fx.store.delete(&lock).await.unwrap();
        let result = fx
            .runtime
            .resume_agent(
                suspended.state_id(),
                vec![ResolvedSuspension::approve(approval)],
                ResumeOptions::default(),
            )
            .await
            .unwrap();
        assert!(result.is_complete());
        assert!(!fx.store.exists(&lock).await.unwrap());
    }
}

// =============================================================================
// Nested sub-agents
// =============================================================================

mod nested_tests {
    use super::*;
    use agent_orchestrator::ResolvedSuspension;

    #[tokio::test]
    async fn test_leaf_approval_surfaces_once_at_root() {
        let fx = nested_fixture();
        let recorder = RecordingHook::new("root-rec");
        fx.hooks.register(&key("root"), recorder.clone());

        let result = fx
            .runtime
            .run_agent(&key("root"), "release", RunOptions::default())
            .await
            .unwrap();

        let stack = result.suspension().expect("suspended");
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.entries[0].manifest_id, "root");
        assert_eq!(stack.entries[0].state_id, result.state_id());
        assert_eq!(stack.entries[0].pending_tool_call_id, "r1");
        assert_eq!(stack.entries[1].manifest_id, "mid");
        assert_eq!(stack.entries[1].pending_tool_call_id, "m1");
        assert_eq!(stack.leaf.manifest_id, "leaf");
        only_approval(stack);

        for level in stack.entries.iter().map(|e| e.state_id).chain([stack.leaf.state_id]) {
            let state = fx.runtime.state(level).await.unwrap().unwrap();
            assert_eq!(state.status, AgentStatus::Suspended);
        }
        let mid = fx.runtime.state(stack.entries[1].state_id).await.unwrap().unwrap();
        assert_eq!(mid.parent.as_ref().unwrap().parent_state_id, result.state_id());

        // one suspension observed by the root, not one per level
        let events = recorder.recorded().await;
        assert_eq!(
            events,
            vec![
                LifecycleEvent::AgentStart,
                LifecycleEvent::SubAgentStart,
                LifecycleEvent::SubAgentSuspend,
                LifecycleEvent::AgentSuspend,
            ]
        );
    }

    #[tokio::test]
    async fn test_resume_walks_stack_from_leaf_to_root() {
        let fx = nested_fixture();
        let recorder = RecordingHook::new("root-rec");
        fx.hooks.register(&key("root"), recorder.clone());

        let suspended = fx
            .runtime
            .run_agent(&key("root"), "release", RunOptions::default())
            .await
            .unwrap();
        let stack = suspended.suspension().unwrap().clone();
        let approval = only_approval(&stack);

        let result = fx
            .runtime
            .resume_agent(
                suspended.state_id(),
                vec![ResolvedSuspension::approve(approval)],
                ResumeOptions::default(),
            )
            .await
            .unwrap();

        let output = result.output().expect("complete");
        assert_eq!(output.text, "root done");
        assert_eq!(fx.deploy.calls(), 1);

        let leaf = fx.runtime.state(stack.leaf.state_id).await.unwrap().unwrap();
        let mid = fx.runtime.state(stack.entries[1].state_id).await.unwrap().unwrap();
        assert_eq!(leaf.status, AgentStatus::Complete);
        assert_eq!(mid.status, AgentStatus::Complete);
        assert_eq!(mid.steps[0].tool_results[0].content, "leaf done");

        let root = fx.runtime.state(suspended.state_id()).await.unwrap().unwrap();
        assert_eq!(root.steps[0].tool_results[0].content, "mid done");
        assert!(root.suspension.is_none());

        assert!(recorder.recorded().await.ends_with(&[
            LifecycleEvent::AgentResume,
            LifecycleEvent::SubAgentComplete,
            LifecycleEvent::AgentComplete,
        ]));
        assert_eq!(fx.model.requests_for("root").await.len(), 2);
    }

    #[tokio::test]
    async fn test_sub_agent_hooks_see_persisted_child_state() {
        let fx = nested_fixture();
        let hook = ChildStatusHook::new(fx.runtime.clone());
        fx.hooks.register(&key("root"), hook.clone());

        let suspended = fx
            .runtime
            .run_agent(&key("root"), "release", RunOptions::default())
            .await
            .unwrap();
        assert_eq!(
            hook.seen().await,
            vec![(LifecycleEvent::SubAgentSuspend, Some(AgentStatus::Suspended))]
        );

        let approval = only_approval(suspended.suspension().unwrap());
        fx.runtime
            .resume_agent(
                suspended.state_id(),
                vec![ResolvedSuspension::approve(approval)],
                ResumeOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(
            hook.seen().await,
            vec![
                (LifecycleEvent::SubAgentSuspend, Some(AgentStatus::Suspended)),
                (LifecycleEvent::SubAgentComplete, Some(AgentStatus::Complete)),
            ]
        );
    }

    #[tokio::test]
    async fn test_cancelled_child_fires_sub_agent_cancelled_on_parent() {
        use agent_orchestrator::CancellationSignals;
        use agent_orchestrator::testing::CancelOnExecuteTool;

        let root = AgentManifest::new("root", "1")
            .on_text_only(OnTextOnly::Stop)
            .with_sub_agent(SubAgentRef::new("worker", "1"));
        let worker = AgentManifest::new("worker", "1")
            .with_tool("halt")
            .stop_when(StopCondition::step_count(5));
        let model = ScriptedModel::new()
            .script(
                "root",
                [ModelResponse::tool_call("r1", "worker", json!({"input": "go"}))],
            )
            .script("worker", [ModelResponse::tool_call("w1", "halt", json!({}))]);
        let fx = fixture_with(vec![root, worker], model, |builder, store| {
            let signals = CancellationSignals::new(store.clone(), Duration::from_secs(60));
            builder.tool(CancelOnExecuteTool::new("halt", signals))
        });
        let recorder = RecordingHook::new("root-rec");
        fx.hooks.register(&key("root"), recorder.clone());
        let hook = ChildStatusHook::new(fx.runtime.clone());
        fx.hooks.register(&key("root"), hook.clone());

        let result = fx
            .runtime
            .run_agent(&key("root"), "go", RunOptions::default())
            .await
            .unwrap();
        assert!(matches!(result, AgentRunResult::Cancelled { .. }));

        assert_eq!(
            recorder.recorded().await,
            vec![
                LifecycleEvent::AgentStart,
                LifecycleEvent::SubAgentStart,
                LifecycleEvent::SubAgentCancelled,
                LifecycleEvent::AgentCancelled,
            ]
        );
        let cancelled = recorder
            .inputs()
            .await
            .into_iter()
            .find(|i| i.event == LifecycleEvent::SubAgentCancelled)
            .unwrap();
        assert_eq!(cancelled.reason.as_deref(), Some("cancelled by tool"));
        assert_eq!(cancelled.sub_agent.as_ref().unwrap().tool_call_id, "r1");
        assert_eq!(
            hook.seen().await,
            vec![(LifecycleEvent::SubAgentCancelled, Some(AgentStatus::Cancelled))]
        );

        let root = fx.runtime.state(result.state_id()).await.unwrap().unwrap();
        assert_eq!(root.status, AgentStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_resuming_a_sub_agent_state_is_rejected() {
        let fx = nested_fixture();
        let suspended = fx
            .runtime
            .run_agent(&key("root"), "release", RunOptions::default())
            .await
            .unwrap();
        let stack = suspended.suspension().unwrap().clone();
        let approval = only_approval(&stack);

        let err = fx
            .runtime
            .resume_agent(
                stack.leaf.state_id,
                vec![ResolvedSuspension::approve(approval)],
                ResumeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_bad_request());
    }

    #[tokio::test]
    async fn test_child_error_fails_parent() {
        let root = AgentManifest::new("root", "1")
            .on_text_only(OnTextOnly::Stop)
            .with_sub_agent(SubAgentRef::new("broken", "1"));
        let broken = AgentManifest::new("broken", "1");
        let model = ScriptedModel::new()
            .script(
                "root",
                [ModelResponse::tool_call("r1", "broken", json!({"input": "x"}))],
            )
            .fail_next("broken", "provider down");
        let fx = fixture(vec![root, broken], model);
        let recorder = RecordingHook::new("root-rec");
        fx.hooks.register(&key("root"), recorder.clone());

        let result = fx
            .runtime
            .run_agent(&key("root"), "go", RunOptions::default())
            .await
            .unwrap();
        let error = result.error().expect("error");
        assert_eq!(error.code, agent_orchestrator::ErrorKind::GatewayTimeout);
        assert!(
            recorder
                .recorded()
                .await
                .contains(&LifecycleEvent::SubAgentError)
        );
    }
}

// =============================================================================
// Cancelling suspended runs
// =============================================================================

mod suspended_cancel_tests {
    use super::*;
    use agent_orchestrator::ResolvedSuspension;

    #[tokio::test]
    async fn test_cancel_suspended_root_cancels_every_level() {
        let fx = nested_fixture();
        let recorder = RecordingHook::new("root-rec");
        fx.hooks.register(&key("root"), recorder.clone());

        let suspended = fx
            .runtime
            .run_agent(&key("root"), "release", RunOptions::default())
            .await
            .unwrap();
        let stack = suspended.suspension().unwrap().clone();

        fx.runtime
            .cancel_agent(suspended.state_id(), "operator abort")
            .await
            .unwrap();

        for level in stack.entries.iter().map(|e| e.state_id).chain([stack.leaf.state_id]) {
            let state = fx.runtime.state(level).await.unwrap().unwrap();
            assert_eq!(state.status, AgentStatus::Cancelled);
            assert_eq!(state.cancel_reason.as_deref(), Some("operator abort"));
        }
        assert_eq!(
            recorder.recorded().await.last(),
            Some(&LifecycleEvent::AgentCancelled)
        );

        let approval = only_approval(&stack);
        let err = fx
            .runtime
            .resume_agent(
                suspended.state_id(),
                vec![ResolvedSuspension::approve(approval)],
                ResumeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_bad_request());
        assert_eq!(fx.deploy.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_suspended_sub_agent_is_rejected() {
        let fx = nested_fixture();
        let suspended = fx
            .runtime
            .run_agent(&key("root"), "release", RunOptions::default())
            .await
            .unwrap();
        let stack = suspended.suspension().unwrap().clone();

        let err = fx
            .runtime
            .cancel_agent(stack.leaf.state_id, "abort")
            .await
            .unwrap_err();
        assert!(err.is_bad_request());
        let root = fx.runtime.state(suspended.state_id()).await.unwrap().unwrap();
        assert_eq!(root.status, AgentStatus::Suspended);
    }

    #[tokio::test]
    async fn test_root_cancel_reaches_running_descendant() {
        use agent_orchestrator::CancellationSignals;

        let fx = nested_fixture();
        let suspended = fx
            .runtime
            .run_agent(&key("root"), "release", RunOptions::default())
            .await
            .unwrap();
        let stack = suspended.suspension().unwrap().clone();

        // a root marker left by a cancel that raced the resume
        let signals = CancellationSignals::new(fx.store.clone(), Duration::from_secs(60));
        signals
            .signal(suspended.state_id(), "shutdown")
            .await
            .unwrap();

        let result = fx
            .runtime
            .resume_agent(
                suspended.state_id(),
                vec![ResolvedSuspension::approve(only_approval(&stack))],
                ResumeOptions::default(),
            )
            .await
            .unwrap();
        assert!(matches!(result, AgentRunResult::Cancelled { .. }));
        assert_eq!(fx.deploy.calls(), 0);

        let leaf = fx.runtime.state(stack.leaf.state_id).await.unwrap().unwrap();
        assert_eq!(leaf.status, AgentStatus::Cancelled);
    }
}

// =============================================================================
// Failed resumes and overrides
// =============================================================================

mod resume_failure_tests {
    use super::*;
    use agent_orchestrator::{ErrorKind, KeyValueStore, ResolvedSuspension};

    #[tokio::test]
    async fn test_unresolvable_tool_leaves_run_suspended() {
        let fx = ops_fixture();
        let suspended = fx
            .runtime
            .run_agent(&key("ops"), "release", RunOptions::default())
            .await
            .unwrap();
        let state_id = suspended.state_id();
        let stack = suspended.suspension().unwrap().clone();
        let approval = only_approval(&stack);

        // shares the store, but has no deploy tool registered
        let degraded = AgentRuntime::builder()
            .manifests([ops_manifest()].into_iter().collect::<InMemoryManifestRegistry>())
            .model(fx.model.clone())
            .store(fx.store.clone())
            .config(RuntimeConfig::default().with_poll_interval(Duration::ZERO))
            .build()
            .unwrap();
        let err = degraded
            .resume_agent(
                state_id,
                vec![ResolvedSuspension::approve(approval.clone())],
                ResumeOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let state = fx.runtime.state(state_id).await.unwrap().unwrap();
        assert_eq!(state.status, AgentStatus::Suspended);
        assert_eq!(state.suspension.as_ref(), Some(&stack));
        let lock = format!("agent:lock:{}", state_id);
        assert!(!fx.store.exists(&lock).await.unwrap());

        let result = fx
            .runtime
            .resume_agent(
                state_id,
                vec![ResolvedSuspension::approve(approval)],
                ResumeOptions::default(),
            )
            .await
            .unwrap();
        assert!(result.is_complete());
        assert_eq!(fx.deploy.calls(), 1);
    }

    #[tokio::test]
    async fn test_storage_failure_mid_resume_marks_root_error() {
        let fx = nested_fixture();
        let suspended = fx
            .runtime
            .run_agent(&key("root"), "release", RunOptions::default())
            .await
            .unwrap();
        let state_id = suspended.state_id();
        let stack = suspended.suspension().unwrap().clone();
        let approval = only_approval(&stack);

        fx.store
            .block(format!("agent:state:{}", stack.leaf.state_id))
            .await;
        let err = fx
            .runtime
            .resume_agent(
                state_id,
                vec![ResolvedSuspension::approve(approval.clone())],
                ResumeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("refused"));
        assert_eq!(fx.deploy.calls(), 0);

        let root = fx.runtime.state(state_id).await.unwrap().unwrap();
        assert_eq!(root.status, AgentStatus::Error);
        assert!(root.suspension.is_none());
        assert!(root.error.unwrap().message.contains("refused"));
        let mid = fx.runtime.state(stack.entries[1].state_id).await.unwrap().unwrap();
        assert_eq!(mid.status, AgentStatus::Suspended);

        let lock = format!("agent:lock:{}", state_id);
        assert!(!fx.store.exists(&lock).await.unwrap());
        let err = fx
            .runtime
            .resume_agent(
                state_id,
                vec![ResolvedSuspension::approve(approval)],
                ResumeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.is_bad_request());
    }

    #[tokio::test]
    async fn test_resume_options_override_persisted_settings() {
        let fx = ops_fixture();
        let suspended = fx
            .runtime
            .run_agent(&key("ops"), "release", RunOptions::default())
            .await
            .unwrap();
        let approval = only_approval(suspended.suspension().unwrap());
        let before = fx.runtime.state(suspended.state_id()).await.unwrap().unwrap();
        assert!(before.user_id.is_none());

        let options = ResumeOptions::new()
            .user("operator-7")
            .timeout(Duration::from_secs(42));
        let result = fx
            .runtime
            .resume_agent(
                suspended.state_id(),
                vec![ResolvedSuspension::approve(approval)],
                options,
            )
            .await
            .unwrap();
        assert!(result.is_complete());

        let after = fx.runtime.state(suspended.state_id()).await.unwrap().unwrap();
        assert_eq!(after.user_id.as_deref(), Some("operator-7"));
        assert_eq!(after.timeout_ms, 42_000);
    }
}
