//! Human-in-the-loop suspension model.
//!
//! A run that needs approval stops at a step boundary and records a
//! [`SuspensionStack`]: one [`StackEntry`] per ancestor agent (root first),
//! each waiting on the tool call that invoked its child, plus the
//! [`LeafSuspension`] describing what the deepest agent is waiting for.
//! Nested approvals therefore surface once, at the root.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::manifest::ManifestKey;
use crate::types::{ApprovalId, StateId, ToolApprovalRequestBlock};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Suspension {
    ToolApproval(ToolApprovalSuspension),
}

impl Suspension {
    pub fn approval_id(&self) -> &ApprovalId {
        match self {
            Suspension::ToolApproval(s) => &s.approval_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolApprovalSuspension {
    pub approval_id: ApprovalId,
    pub tool_call_id: String,
    pub tool_name: String,
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl From<&ToolApprovalRequestBlock> for Suspension {
    fn from(request: &ToolApprovalRequestBlock) -> Self {
        Suspension::ToolApproval(ToolApprovalSuspension {
            approval_id: request.approval_id.clone(),
            tool_call_id: request.tool_call_id.clone(),
            tool_name: request.tool_name.clone(),
            args: request.args.clone(),
            description: request.description.clone(),
        })
    }
}

/// An ancestor agent blocked on its child's result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackEntry {
    pub manifest_id: String,
    pub manifest_version: String,
    pub state_id: StateId,
    pub pending_tool_call_id: String,
}

impl StackEntry {
    pub fn new(manifest: &ManifestKey, state_id: StateId, pending_tool_call_id: impl Into<String>) -> Self {
        Self {
            manifest_id: manifest.id.clone(),
            manifest_version: manifest.version.clone(),
            state_id,
            pending_tool_call_id: pending_tool_call_id.into(),
        }
    }

    pub fn manifest(&self) -> ManifestKey {
        ManifestKey::new(&self.manifest_id, &self.manifest_version)
    }
}

/// The agent that actually suspended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafSuspension {
    pub manifest_id: String,
    pub manifest_version: String,
    pub state_id: StateId,
    pub suspensions: Vec<Suspension>,
}

impl LeafSuspension {
    pub fn manifest(&self) -> ManifestKey {
        ManifestKey::new(&self.manifest_id, &self.manifest_version)
    }

    pub fn approval_ids(&self) -> impl Iterator<Item = &ApprovalId> {
        self.suspensions.iter().map(Suspension::approval_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionStack {
    /// Ancestors, root first. Empty when the root itself suspended.
    pub entries: Vec<StackEntry>,
    pub leaf: LeafSuspension,
}

impl SuspensionStack {
    pub fn leaf(manifest: &ManifestKey, state_id: StateId, suspensions: Vec<Suspension>) -> Self {
        Self {
            entries: Vec::new(),
            leaf: LeafSuspension {
                manifest_id: manifest.id.clone(),
                manifest_version: manifest.version.clone(),
                state_id,
                suspensions,
            },
        }
    }

    /// Adds the parent's entry in front; called as the suspension bubbles up one level.
    pub fn with_parent(mut self, entry: StackEntry) -> Self {
        self.entries.insert(0, entry);
        self
    }

    /// Sub-agent call depth at the moment of suspension.
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// State id of the outermost agent.
    pub fn root_state_id(&self) -> StateId {
        self.entries
            .first()
            .map(|e| e.state_id)
            .unwrap_or(self.leaf.state_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ResolvedSuspension {
    ToolApproval {
        approval_id: ApprovalId,
        approved: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl ResolvedSuspension {
    pub fn approve(approval_id: impl Into<ApprovalId>) -> Self {
        Self::ToolApproval {
            approval_id: approval_id.into(),
            approved: true,
            reason: None,
        }
    }

    pub fn deny(approval_id: impl Into<ApprovalId>, reason: impl Into<String>) -> Self {
        Self::ToolApproval {
            approval_id: approval_id.into(),
            approved: false,
            reason: Some(reason.into()),
        }
    }

    pub fn approval_id(&self) -> &ApprovalId {
        match self {
            Self::ToolApproval { approval_id, .. } => approval_id,
        }
    }
}

/// Checks that `resolved` answers every pending leaf approval exactly once and
/// names nothing else.
pub fn validate_resolutions(
    leaf: &LeafSuspension,
    resolved: &[ResolvedSuspension],
) -> crate::Result<()> {
    let pending: HashSet<&ApprovalId> = leaf.approval_ids().collect();
    let mut seen = HashSet::new();

    for resolution in resolved {
        let id = resolution.approval_id();
        if !pending.contains(id) {
            return Err(crate::Error::validation(
                "resolved",
                format!("unknown approval id '{}'", id),
            ));
        }
        if !seen.insert(id) {
            return Err(crate::Error::validation(
                "resolved",
                format!("approval id '{}' resolved more than once", id),
            ));
        }
    }

    let mut missing: Vec<&str> = pending
        .difference(&seen)
        .map(|id| id.as_str())
        .collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        return Err(crate::Error::validation(
            "resolved",
            format!("unresolved approval ids: {}", missing.join(", ")),
        ));
    }
    Ok(())
}
