//! Run results and streamed events.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::AgentStatus;
use crate::AppError;
use crate::manifest::ManifestKey;
use crate::model::FinishReason;
use crate::suspension::SuspensionStack;
use crate::types::{StateId, ToolCallBlock, ToolResultBlock};

/// Final answer of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub text: String,
    /// Parsed structured output, present when the manifest declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub steps: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentRunResult {
    Complete {
        state_id: StateId,
        output: AgentOutput,
    },
    Suspended {
        state_id: StateId,
        suspension: SuspensionStack,
    },
    Error {
        state_id: StateId,
        error: AppError,
    },
    Cancelled {
        state_id: StateId,
        reason: String,
    },
}

impl AgentRunResult {
    pub fn state_id(&self) -> StateId {
        match self {
            Self::Complete { state_id, .. }
            | Self::Suspended { state_id, .. }
            | Self::Error { state_id, .. }
            | Self::Cancelled { state_id, .. } => *state_id,
        }
    }

    pub fn status(&self) -> AgentStatus {
        match self {
            Self::Complete { .. } => AgentStatus::Complete,
            Self::Suspended { .. } => AgentStatus::Suspended,
            Self::Error { .. } => AgentStatus::Error,
            Self::Cancelled { .. } => AgentStatus::Cancelled,
        }
    }

    pub fn output(&self) -> Option<&AgentOutput> {
        match self {
            Self::Complete { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn suspension(&self) -> Option<&SuspensionStack> {
        match self {
            Self::Suspended { suspension, .. } => Some(suspension),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&AppError> {
        match self {
            Self::Error { error, .. } => Some(error),
            _ => None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete { .. })
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self, Self::Suspended { .. })
    }
}

/// Progress emitted by a streamed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    StepStarted {
        state_id: StateId,
        step_number: u32,
    },
    Text {
        state_id: StateId,
        text: String,
    },
    ToolCall {
        state_id: StateId,
        call: ToolCallBlock,
    },
    ToolResult {
        state_id: StateId,
        result: ToolResultBlock,
    },
    StepFinished {
        state_id: StateId,
        step_number: u32,
        finish_reason: FinishReason,
    },
    SubAgentStarted {
        parent_state_id: StateId,
        state_id: StateId,
        manifest: ManifestKey,
    },
    /// Always the last event of a stream whose run started.
    Finished { result: Box<AgentRunResult> },
    /// The run could not start.
    Failed { error: AppError },
}

/// Forwards events to a stream consumer; a disabled sink drops them.
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    tx: Option<mpsc::UnboundedSender<AgentEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<AgentEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: AgentEvent) {
        if let Some(tx) = &self.tx {
            // The receiver going away only stops streaming, never the run.
            let _ = tx.send(event);
        }
    }
}
