//! # agent-orchestrator
//!
//! Execution and orchestration core for tool-using AI agents.
//!
//! The crate runs an agent manifest step by step against a model client,
//! suspends the run when a tool call needs human approval, persists and
//! resumes run state across processes, drives nested sub-agents as tool calls
//! and schedules asynchronous work on a durable, priority-aware task queue.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent_orchestrator::{AgentManifest, AgentRunResult, AgentRuntime, ManifestKey, RunOptions};
//! use agent_orchestrator::manifest::InMemoryManifestRegistry;
//! use agent_orchestrator::testing::ScriptedModel;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), agent_orchestrator::Error> {
//!     let manifests = InMemoryManifestRegistry::new();
//!     manifests.register(AgentManifest::new("greeter", "1"));
//!
//!     let runtime = AgentRuntime::builder()
//!         .manifests(manifests)
//!         .model(ScriptedModel::new())
//!         .build()?;
//!
//!     let key: ManifestKey = "greeter:1".parse()?;
//!     match runtime.run_agent(&key, "hello", RunOptions::default()).await? {
//!         AgentRunResult::Complete { output, .. } => println!("{}", output.text),
//!         other => println!("{:?}", other),
//!     }
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod agent;
pub mod config;
pub mod hooks;
pub mod manifest;
pub mod model;
pub mod observability;
pub mod prelude;
pub mod store;
pub mod suspension;
pub mod tasks;
pub mod testing;
pub mod tools;
pub mod types;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use agent::{
    AgentEvent, AgentOutput, AgentRunResult, AgentRuntime, AgentRuntimeBuilder, AgentState,
    AgentStatus, CancellationMonitor, CancellationSignals, ParentAgentContext, ResumeOptions,
    RunOptions, StepResult,
};
pub use config::{ConfigError, ConfigProvider, RuntimeConfig};
pub use hooks::{FnHook, Hook, HookInput, HookManager, HookRegistry, LifecycleEvent};
pub use manifest::{
    AgentManifest, InMemoryManifestRegistry, ManifestKey, ManifestRegistry, OnTextOnly,
    OutputSpec, StopCondition, SubAgentRef,
};
pub use model::{CompletionRequest, FinishReason, ModelClient, ModelResponse};
pub use observability::RuntimeMetrics;
pub use store::{KeyValueStore, MemoryKeyValueStore, MemoryTaskStore, StoreError, TaskStore};
pub use suspension::{ResolvedSuspension, Suspension, SuspensionStack};
pub use tasks::{
    QueueJob, QueueRegistry, ScheduleOptions, TaskDefinition, TaskRecord, TaskScheduler,
    TaskStatus, TaskWorker,
};
pub use tools::{Tool, ToolContext, ToolOutput, ToolRegistry};
pub use types::{ApprovalId, ContentBlock, Message, Role, StateId, TaskId, ToolChoice};

/// Error type for orchestration operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed input from the caller.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// A value failed validation.
    #[error("Validation failed for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Missing manifest, state, task or tool.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Entity is not in the state the operation requires.
    #[error("Invalid state for {id}: expected {expected}, found {actual}")]
    InvalidState {
        id: String,
        expected: String,
        actual: String,
    },

    /// Wall-clock or step-level timeout.
    #[error("Operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// Upstream rate limiting.
    #[error("Too many requests{}", match retry_after {
        Some(d) => format!(", retry in {:.0}s", d.as_secs_f64()),
        None => String::new(),
    })]
    TooManyRequests { retry_after: Option<Duration> },

    #[error("Internal error: {0}")]
    InternalServer(String),

    /// A lifecycle hook returned an error or timed out.
    #[error("Hook '{hook}' failed on {event}: {reason}")]
    HookFailed {
        hook: String,
        event: String,
        reason: String,
    },

    /// A sub-agent ended in error; carries the child's error code.
    #[error("Sub-agent {agent} failed: {message}")]
    SubAgentFailed {
        agent: String,
        code: ErrorKind,
        message: String,
    },

    /// Model provider or queue broker unreachable.
    #[error("Upstream unavailable: {0}")]
    GatewayTimeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// User-visible error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    Timeout,
    TooManyRequests,
    InternalServer,
    GatewayTimeout,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::BadRequest => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::TooManyRequests => "too_many_requests",
            Self::InternalServer => "internal_server",
            Self::GatewayTimeout => "gateway_timeout",
        };
        write!(f, "{}", s)
    }
}

/// Structured `{code, message}` error carried by run results and persisted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    pub code: ErrorKind,
    pub message: String,
}

impl AppError {
    pub fn new(code: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl From<&Error> for AppError {
    fn from(err: &Error) -> Self {
        let message = match err {
            Error::SubAgentFailed { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self::new(err.kind(), message)
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        Self::from(&err)
    }
}

impl Error {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn invalid_state(
        id: impl ToString,
        expected: impl ToString,
        actual: impl ToString,
    ) -> Self {
        Error::InvalidState {
            id: id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadRequest(_) | Error::Validation { .. } | Error::InvalidState { .. } => {
                ErrorKind::BadRequest
            }
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::TooManyRequests { .. } => ErrorKind::TooManyRequests,
            Error::GatewayTimeout(_) => ErrorKind::GatewayTimeout,
            Error::SubAgentFailed { code, .. } => *code,
            Error::InternalServer(_)
            | Error::HookFailed { .. }
            | Error::Storage(_)
            | Error::Json(_)
            | Error::Config(_) => ErrorKind::InternalServer,
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.kind() == ErrorKind::BadRequest
    }

    /// Whether the task worker may re-attempt a job that failed with this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TooManyRequests { .. }
                | Error::GatewayTimeout(_)
                | Error::Timeout(_)
                | Error::Storage(_)
                | Error::InternalServer(_)
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::TooManyRequests { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::NotFound { key } => {
                Error::Config(format!("Key not found: {}", key))
            }
            config::ConfigError::InvalidValue { key, message } => {
                Error::Config(format!("Invalid value for {}: {}", key, message))
            }
            config::ConfigError::Serialization(e) => Error::Json(e),
            config::ConfigError::Env(e) => Error::Config(e.to_string()),
            config::ConfigError::Provider { message } => Error::Config(message),
        }
    }
}

impl From<store::StoreError> for Error {
    fn from(err: store::StoreError) -> Self {
        match err {
            store::StoreError::NotFound { entity, id } => Error::NotFound { entity, id },
            store::StoreError::Storage { message } => Error::Storage(message),
            store::StoreError::Unavailable { message } => Error::GatewayTimeout(message),
            store::StoreError::Serialization(e) => Error::Json(e),
        }
    }
}

impl From<types::ParseIdError> for Error {
    fn from(err: types::ParseIdError) -> Self {
        Error::BadRequest(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
