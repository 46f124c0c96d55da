//! Per-call execution context handed to tools.

use crate::manifest::ManifestKey;
use crate::types::StateId;

#[derive(Debug, Clone)]
pub struct ToolContext {
    pub state_id: StateId,
    pub manifest: ManifestKey,
    pub tool_call_id: String,
    pub step_number: u32,
    pub user_id: Option<String>,
}

impl ToolContext {
    pub fn new(state_id: StateId, manifest: ManifestKey, tool_call_id: impl Into<String>) -> Self {
        Self {
            state_id,
            manifest,
            tool_call_id: tool_call_id.into(),
            step_number: 0,
            user_id: None,
        }
    }

    pub fn with_step(mut self, step_number: u32) -> Self {
        self.step_number = step_number;
        self
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }
}
