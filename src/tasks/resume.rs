//! Built-in task that resumes a suspended agent once approvals arrive.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::definition::TaskDefinition;
use super::record::TaskRecord;
use super::worker::TaskHandler;
use crate::agent::{AgentRunResult, AgentRuntime, ResumeOptions};
use crate::suspension::ResolvedSuspension;
use crate::types::StateId;

pub const RESUME_AGENT_TASK: &str = "agent.resume";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumeAgentPayload {
    pub state_id: StateId,
    pub resolved: Vec<ResolvedSuspension>,
}

impl ResumeAgentPayload {
    pub fn new(state_id: StateId, resolved: Vec<ResolvedSuspension>) -> Self {
        Self { state_id, resolved }
    }
}

/// Calls [`AgentRuntime::resume_agent`] with the task payload. The task's
/// user, when set, is carried onto the resumed run.
///
/// Run outcomes (complete, suspended again, error, cancelled) all count as
/// a handled task; only failures to resume at all are task failures.
pub struct ResumeAgentHandler {
    runtime: AgentRuntime,
}

impl ResumeAgentHandler {
    pub fn new(runtime: AgentRuntime) -> Self {
        Self { runtime }
    }

    pub fn definition() -> TaskDefinition {
        TaskDefinition::typed::<ResumeAgentPayload>(RESUME_AGENT_TASK).on_queue("agents")
    }
}

#[async_trait]
impl TaskHandler for ResumeAgentHandler {
    fn task_name(&self) -> &str {
        RESUME_AGENT_TASK
    }

    async fn handle(&self, task: &TaskRecord) -> crate::Result<()> {
        let payload: ResumeAgentPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| crate::Error::validation("agent.resume payload", e.to_string()))?;

        let mut options = ResumeOptions::new();
        if let Some(user_id) = &task.user_id {
            options = options.user(user_id.clone());
        }
        let result = self
            .runtime
            .resume_agent(payload.state_id, payload.resolved, options)
            .await?;
        info!(
            task_id = %task.id,
            state_id = %payload.state_id,
            status = %result.status(),
            "Resumed agent from task"
        );
        if let AgentRunResult::Error { error, .. } = &result {
            tracing::debug!(state_id = %payload.state_id, error = %error, "Resumed run ended in error");
        }
        Ok(())
    }
}
