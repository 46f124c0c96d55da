//! Prelude module for convenient imports.
//!
//! # Usage
//!
//! ```rust
//! use agent_orchestrator::prelude::*;
//! ```

// Core types
pub use crate::AgentRunResult;
pub use crate::AgentRuntime;
pub use crate::AgentRuntimeBuilder;
pub use crate::Error;
pub use crate::ErrorKind;
pub use crate::Result;
pub use crate::ResumeOptions;
pub use crate::RunOptions;

// Manifests
pub use crate::manifest::{
    AgentManifest, InMemoryManifestRegistry, ManifestKey, ManifestRegistry, OnTextOnly,
    StopCondition, SubAgentRef,
};

// Model
pub use crate::model::{CompletionRequest, FinishReason, ModelClient, ModelResponse};

// Tools
pub use crate::tools::{SchemaTool, Tool, ToolContext, ToolOutput, ToolRegistry};

// Suspension
pub use crate::suspension::{ResolvedSuspension, SuspensionStack};

// Hooks
pub use crate::hooks::{FnHook, Hook, HookInput, HookRegistry, LifecycleEvent};

// Tasks
pub use crate::tasks::{
    QueueRegistry, ScheduleOptions, TaskDefinition, TaskHandler, TaskScheduler, TaskWorker,
};

// Types
pub use crate::types::{ContentBlock, Message, Role, StateId, TaskId};
