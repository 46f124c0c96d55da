//! Sub-agent calls.
//!
//! A tool call naming a sub-agent runs the child as a nested call of the
//! parent's loop. The child's own lifecycle hooks fire on the child manifest;
//! the parent's `SubAgent*` hooks fire only after the child's state is written.
//! A suspended child makes the parent suspend too, with its own entry added in
//! front of the child's stack.

use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use super::events::EventSink;
use super::execution::{RunEntry, Settlement};
use super::runtime::Engine;
use super::{AgentEvent, AgentRunResult, AgentRunState, AgentStatus, ParentAgentContext};
use crate::AppError;
use crate::hooks::{HookInput, LifecycleEvent, SubAgentInfo};
use crate::manifest::{SubAgentInput, SubAgentRef};
use crate::suspension::StackEntry;
use crate::types::{Message, StateId, ToolCallBlock, ToolResultBlock};

/// Task text handed to a child; `{"input": "..."}` is the declared shape.
pub(crate) fn sub_agent_input(input: &Value) -> String {
    if let Ok(typed) = serde_json::from_value::<SubAgentInput>(input.clone()) {
        return typed.input;
    }
    match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Engine {
    /// Starts a child run for `call` and drives it to an outcome.
    ///
    /// Boxed because the child loop may itself call sub-agents.
    pub(crate) fn run_child<'a>(
        &'a self,
        parent: &'a AgentRunState,
        sub: &'a SubAgentRef,
        call: &'a ToolCallBlock,
        sink: &'a EventSink,
    ) -> BoxFuture<'a, crate::Result<AgentRunResult>> {
        Box::pin(async move {
            let key = sub.key();
            let manifest = self.manifests.resolve(&key).await?;
            let tools = self.tools.select(&manifest.tools)?;
            let timeout = manifest
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.config.agent_timeout);

            let context = ParentAgentContext::new(&parent.key(), parent.state_id, &call.id);
            let mut child = AgentRunState::new(StateId::new(), manifest, tools, timeout)
                .with_parent(context, parent.child_ancestors())
                .with_user(parent.user_id.clone());
            child.messages.push(Message::user(sub_agent_input(&call.input)));

            let mut state = child.snapshot(AgentStatus::Running);
            self.save_state(&state).await?;
            sink.emit(AgentEvent::SubAgentStarted {
                parent_state_id: parent.state_id,
                state_id: child.state_id,
                manifest: key.clone(),
            });
            debug!(child_state_id = %child.state_id, sub_agent = %key, "Sub-agent started");

            let parent_key = parent.key();
            let info = SubAgentInfo {
                manifest: key,
                state_id: child.state_id,
                tool_call_id: call.id.clone(),
            };
            let event = LifecycleEvent::SubAgentStart;
            let input = HookInput::new(event, parent_key.clone(), parent.state_id).with_sub_agent(info);
            if let Err(e) = self.hooks.dispatch(&parent_key, event, input).await {
                state.error = Some(AppError::from(&e));
                state.transition(AgentStatus::Error);
                self.save_state(&state).await?;
                return Err(e);
            }

            self.execute_run(child, RunEntry::Start, sink).await
        })
    }

    /// Feeds a child's outcome into the parent's pending tool call.
    pub(crate) async fn absorb_child(
        &self,
        run: &mut AgentRunState,
        sub: &SubAgentRef,
        call: &ToolCallBlock,
        child: AgentRunResult,
        sink: &EventSink,
    ) -> crate::Result<Settlement> {
        let parent_key = run.key();
        let parent_state_id = run.state_id;
        let info = SubAgentInfo {
            manifest: sub.key(),
            state_id: child.state_id(),
            tool_call_id: call.id.clone(),
        };
        let input = |event| {
            HookInput::new(event, parent_key.clone(), parent_state_id).with_sub_agent(info.clone())
        };

        match child {
            AgentRunResult::Complete { output, .. } => {
                let event = LifecycleEvent::SubAgentComplete;
                self.hooks
                    .dispatch(&parent_key, event, input(event).with_output(&output.text))
                    .await?;
                let content = match &output.value {
                    Some(value) => value.to_string(),
                    None => output.text,
                };
                self.record_result(run, ToolResultBlock::success(&call.id, &call.name, content), sink);
                Ok(Settlement::Settled)
            }
            AgentRunResult::Suspended { suspension, .. } => {
                let stack = suspension.with_parent(StackEntry::new(&parent_key, parent_state_id, &call.id));
                let event = LifecycleEvent::SubAgentSuspend;
                self.hooks
                    .dispatch(&parent_key, event, input(event).with_suspension(stack.clone()))
                    .await?;
                Ok(Settlement::Suspended(stack))
            }
            AgentRunResult::Error { error, .. } => {
                let event = LifecycleEvent::SubAgentError;
                self.hooks
                    .dispatch(&parent_key, event, input(event).with_error(error.clone()))
                    .await?;
                Err(crate::Error::SubAgentFailed {
                    agent: sub.key().to_string(),
                    code: error.code,
                    message: error.message,
                })
            }
            AgentRunResult::Cancelled { reason, .. } => {
                let event = LifecycleEvent::SubAgentCancelled;
                self.hooks
                    .dispatch(&parent_key, event, input(event).with_reason(&reason))
                    .await?;
                Ok(Settlement::Cancelled(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sub_agent_input_shapes() {
        assert_eq!(sub_agent_input(&json!({"input": "summarize"})), "summarize");
        assert_eq!(sub_agent_input(&json!("plain")), "plain");
        assert_eq!(sub_agent_input(&json!({"query": 1})), r#"{"query":1}"#);
    }
}
