//! Model-completion collaborator.
//!
//! The runtime treats the model as an opaque function from the message history
//! and the available tools to text, tool calls and a finish reason. Provider
//! adapters implement [`ModelClient`]; transport failures should surface as
//! [`Error::GatewayTimeout`](crate::Error::GatewayTimeout) or
//! [`Error::TooManyRequests`](crate::Error::TooManyRequests).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::ManifestKey;
use crate::types::{Message, ToolApprovalRequestBlock, ToolCallBlock, ToolChoice, ToolDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Error,
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// The agent the request is made for.
    pub agent: ManifestKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub tool_choice: ToolChoice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallBlock>,
    /// Approval requests emitted by the model itself.
    #[serde(default)]
    pub approval_requests: Vec<ToolApprovalRequestBlock>,
    pub finish_reason: FinishReason,
}

impl ModelResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            approval_requests: Vec::new(),
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self {
            text: String::new(),
            tool_calls: vec![ToolCallBlock::new(id, name, input)],
            approval_requests: Vec::new(),
            finish_reason: FinishReason::ToolCalls,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_tool_call(mut self, id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        self.tool_calls.push(ToolCallBlock::new(id, name, input));
        self.finish_reason = FinishReason::ToolCalls;
        self
    }

    pub fn with_finish_reason(mut self, reason: FinishReason) -> Self {
        self.finish_reason = reason;
        self
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> crate::Result<ModelResponse>;
}
