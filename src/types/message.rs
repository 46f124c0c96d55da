//! Conversation messages.

use serde::{Deserialize, Serialize};

use super::{
    ApprovalId, ContentBlock, ToolApprovalRequestBlock, ToolApprovalResponseBlock,
    ToolCallBlock, ToolResultBlock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Tool results and approval responses.
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    pub fn assistant(content: Vec<ContentBlock>) -> Self {
        Self {
            role: Role::Assistant,
            content,
        }
    }

    pub fn tool_result(result: ToolResultBlock) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolResult(result)],
        }
    }

    pub fn approval_response(
        approval_id: ApprovalId,
        approved: bool,
        reason: Option<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: vec![ContentBlock::ToolApprovalResponse(ToolApprovalResponseBlock {
                approval_id,
                approved,
                reason,
            })],
        }
    }

    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCallBlock> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolCall(call) => Some(call),
            _ => None,
        })
    }

    pub fn tool_results(&self) -> impl Iterator<Item = &ToolResultBlock> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolResult(result) => Some(result),
            _ => None,
        })
    }

    pub fn approval_requests(&self) -> impl Iterator<Item = &ToolApprovalRequestBlock> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolApprovalRequest(request) => Some(request),
            _ => None,
        })
    }

    pub fn approval_responses(&self) -> impl Iterator<Item = &ToolApprovalResponseBlock> {
        self.content.iter().filter_map(|block| match block {
            ContentBlock::ToolApprovalResponse(response) => Some(response),
            _ => None,
        })
    }

    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls().next().is_some()
    }
}
