//! Agent state: the in-memory run state and its persisted snapshot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::AgentOutput;
use crate::AppError;
use crate::manifest::{AgentManifest, ManifestKey};
use crate::model::FinishReason;
use crate::store::Keyed;
use crate::suspension::SuspensionStack;
use crate::tools::ToolRegistry;
use crate::types::{
    ApprovalId, Message, Role, StateId, ToolApprovalRequestBlock,
    ToolApprovalResponseBlock, ToolCallBlock, ToolChoice, ToolDefinition, ToolResultBlock,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Running,
    Suspended,
    Complete,
    Error,
    Cancelled,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Links a sub-agent run to the parent tool call waiting on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentAgentContext {
    pub parent_manifest_id: String,
    pub parent_manifest_version: String,
    pub parent_state_id: StateId,
    pub tool_call_id: String,
}

impl ParentAgentContext {
    pub fn new(parent: &ManifestKey, parent_state_id: StateId, tool_call_id: impl Into<String>) -> Self {
        Self {
            parent_manifest_id: parent.id.clone(),
            parent_manifest_version: parent.version.clone(),
            parent_state_id,
            tool_call_id: tool_call_id.into(),
        }
    }

    pub fn parent_manifest(&self) -> ManifestKey {
        ManifestKey::new(&self.parent_manifest_id, &self.parent_manifest_version)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_number: u32,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallBlock>,
    #[serde(default)]
    pub tool_results: Vec<ToolResultBlock>,
    pub finish_reason: FinishReason,
}

impl StepResult {
    pub fn called_tool(&self, name: &str) -> bool {
        self.tool_calls.iter().any(|c| c.name == name)
    }
}

/// Persisted snapshot of a run, stored under `agent:state:{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub id: StateId,
    pub manifest_id: String,
    pub manifest_version: String,
    pub status: AgentStatus,
    pub messages: Vec<Message>,
    pub steps: Vec<StepResult>,
    pub step_number: u32,
    #[serde(default)]
    pub output_validation_retries: u32,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<SuspensionStack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentAgentContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<AgentOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentState {
    pub fn manifest(&self) -> ManifestKey {
        ManifestKey::new(&self.manifest_id, &self.manifest_version)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub(crate) fn transition(&mut self, status: AgentStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

impl Keyed for AgentState {
    const NAMESPACE: &'static str = "agent:state";

    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// A child outcome fed back into the parent's pending tool call on resume.
pub(crate) struct ResumedChild {
    pub tool_call_id: String,
    pub result: super::AgentRunResult,
}

/// Mutable state owned by one executing loop instance.
pub struct AgentRunState {
    pub state_id: StateId,
    pub manifest: Arc<AgentManifest>,
    pub messages: Vec<Message>,
    pub steps: Vec<StepResult>,
    pub step_number: u32,
    pub output_validation_retries: u32,
    pub tools: ToolRegistry,
    pub tool_choice: ToolChoice,
    pub parent: Option<ParentAgentContext>,
    pub user_id: Option<String>,
    start_time: Instant,
    timeout: Duration,
    created_at: DateTime<Utc>,
    ancestors: Vec<StateId>,
    pub(crate) resumed_child: Option<ResumedChild>,
}

impl AgentRunState {
    pub fn new(
        state_id: StateId,
        manifest: Arc<AgentManifest>,
        tools: ToolRegistry,
        timeout: Duration,
    ) -> Self {
        Self {
            state_id,
            tool_choice: manifest.tool_choice.clone(),
            manifest,
            messages: Vec::new(),
            steps: Vec::new(),
            step_number: 0,
            output_validation_retries: 0,
            tools,
            parent: None,
            user_id: None,
            start_time: Instant::now(),
            timeout,
            created_at: Utc::now(),
            ancestors: Vec::new(),
            resumed_child: None,
        }
    }

    /// Rebuilds run state from a snapshot. The wall clock restarts at rehydration.
    pub fn from_state(
        state: AgentState,
        manifest: Arc<AgentManifest>,
        tools: ToolRegistry,
        ancestors: Vec<StateId>,
    ) -> Self {
        Self {
            state_id: state.id,
            tool_choice: manifest.tool_choice.clone(),
            manifest,
            messages: state.messages,
            steps: state.steps,
            step_number: state.step_number,
            output_validation_retries: state.output_validation_retries,
            tools,
            parent: state.parent,
            user_id: state.user_id,
            start_time: Instant::now(),
            timeout: Duration::from_millis(state.timeout_ms),
            created_at: state.created_at,
            ancestors,
            resumed_child: None,
        }
    }

    pub fn with_parent(mut self, parent: ParentAgentContext, ancestors: Vec<StateId>) -> Self {
        self.parent = Some(parent);
        self.ancestors = ancestors;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn key(&self) -> ManifestKey {
        self.manifest.key()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_timed_out(&self) -> bool {
        self.start_time.elapsed() > self.timeout
    }

    /// This run followed by every ancestor; a cancellation marker on any of them stops it.
    pub fn cancel_scope(&self) -> Vec<StateId> {
        let mut scope = Vec::with_capacity(self.ancestors.len() + 1);
        scope.push(self.state_id);
        scope.extend(self.ancestors.iter().rev().copied());
        scope
    }

    pub(crate) fn child_ancestors(&self) -> Vec<StateId> {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(self.state_id);
        ancestors
    }

    pub fn snapshot(&self, status: AgentStatus) -> AgentState {
        AgentState {
            id: self.state_id,
            manifest_id: self.manifest.id.clone(),
            manifest_version: self.manifest.version.clone(),
            status,
            messages: self.messages.clone(),
            steps: self.steps.clone(),
            step_number: self.step_number,
            output_validation_retries: self.output_validation_retries,
            timeout_ms: self.timeout.as_millis() as u64,
            user_id: self.user_id.clone(),
            suspension: None,
            parent: self.parent.clone(),
            error: None,
            output: None,
            cancel_reason: None,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self.tools.definitions();
        defs.extend(self.manifest.sub_agents.iter().map(|s| s.definition()));
        defs
    }

    fn last_assistant_index(&self) -> Option<usize> {
        self.messages.iter().rposition(|m| m.role == Role::Assistant)
    }

    fn after_last_assistant(&self) -> &[Message] {
        match self.last_assistant_index() {
            Some(i) => &self.messages[i + 1..],
            None => &[],
        }
    }

    /// Tool calls of the latest assistant message that have no result yet.
    pub fn pending_tool_calls(&self) -> Vec<ToolCallBlock> {
        let Some(index) = self.last_assistant_index() else {
            return Vec::new();
        };
        let answered: Vec<&str> = self.messages[index + 1..]
            .iter()
            .flat_map(|m| m.tool_results())
            .map(|r| r.tool_call_id.as_str())
            .collect();
        self.messages[index]
            .tool_calls()
            .filter(|c| !answered.contains(&c.id.as_str()))
            .cloned()
            .collect()
    }

    pub fn has_pending_tool_calls(&self) -> bool {
        !self.pending_tool_calls().is_empty()
    }

    pub fn approval_request_for(&self, tool_call_id: &str) -> Option<&ToolApprovalRequestBlock> {
        let index = self.last_assistant_index()?;
        self.messages[index]
            .approval_requests()
            .find(|r| r.tool_call_id == tool_call_id)
    }

    pub fn approval_response_for(&self, approval_id: &ApprovalId) -> Option<&ToolApprovalResponseBlock> {
        self.after_last_assistant()
            .iter()
            .flat_map(|m| m.approval_responses())
            .find(|r| &r.approval_id == approval_id)
    }

    /// Approval requests of pending tool calls that no response answers yet.
    pub fn unresolved_approvals(&self) -> Vec<ToolApprovalRequestBlock> {
        let pending = self.pending_tool_calls();
        let Some(index) = self.last_assistant_index() else {
            return Vec::new();
        };
        self.messages[index]
            .approval_requests()
            .filter(|r| pending.iter().any(|c| c.id == r.tool_call_id))
            .filter(|r| self.approval_response_for(&r.approval_id).is_none())
            .cloned()
            .collect()
    }

    /// Appends a tool result message and attaches it to the step that issued the call.
    pub fn record_tool_result(&mut self, result: ToolResultBlock) {
        if let Some(step) = self
            .steps
            .iter_mut()
            .rev()
            .find(|s| s.tool_calls.iter().any(|c| c.id == result.tool_call_id))
        {
            step.tool_results.push(result.clone());
        }
        self.messages.push(Message::tool_result(result));
    }

    pub fn last_text(&self) -> String {
        self.steps.last().map(|s| s.text.clone()).unwrap_or_default()
    }

    pub(crate) fn take_resumed_child(&mut self, tool_call_id: &str) -> Option<super::AgentRunResult> {
        if self
            .resumed_child
            .as_ref()
            .is_some_and(|c| c.tool_call_id == tool_call_id)
        {
            return self.resumed_child.take().map(|c| c.result);
        }
        None
    }
}
