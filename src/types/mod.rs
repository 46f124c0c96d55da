//! Shared identifier and conversation types.

mod content;
mod ids;
mod message;
mod tool;

pub use content::{
    ContentBlock, ToolApprovalRequestBlock, ToolApprovalResponseBlock, ToolCallBlock,
    ToolResultBlock,
};
pub use ids::{ApprovalId, ParseIdError, StateId, TaskId};
pub use message::{Message, Role};
pub use tool::{ToolChoice, ToolDefinition};
