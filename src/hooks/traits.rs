//! Hook traits and types.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::AppError;
use crate::manifest::ManifestKey;
use crate::suspension::SuspensionStack;
use crate::types::StateId;

/// Lifecycle transitions a hook can observe.
///
/// `Agent*` events fire on the manifest's own run; `SubAgent*` events fire on
/// the parent manifest when one of its child runs changes state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleEvent {
    #[serde(rename = "onAgentStart")]
    AgentStart,
    #[serde(rename = "onAgentResume")]
    AgentResume,
    #[serde(rename = "onAgentComplete")]
    AgentComplete,
    #[serde(rename = "onAgentSuspend")]
    AgentSuspend,
    #[serde(rename = "onAgentError")]
    AgentError,
    #[serde(rename = "onAgentCancelled")]
    AgentCancelled,
    #[serde(rename = "onSubAgentStart")]
    SubAgentStart,
    #[serde(rename = "onSubAgentComplete")]
    SubAgentComplete,
    #[serde(rename = "onSubAgentSuspend")]
    SubAgentSuspend,
    #[serde(rename = "onSubAgentError")]
    SubAgentError,
    #[serde(rename = "onSubAgentCancelled")]
    SubAgentCancelled,
}

impl LifecycleEvent {
    pub fn all() -> &'static [LifecycleEvent] {
        &[
            LifecycleEvent::AgentStart,
            LifecycleEvent::AgentResume,
            LifecycleEvent::AgentComplete,
            LifecycleEvent::AgentSuspend,
            LifecycleEvent::AgentError,
            LifecycleEvent::AgentCancelled,
            LifecycleEvent::SubAgentStart,
            LifecycleEvent::SubAgentComplete,
            LifecycleEvent::SubAgentSuspend,
            LifecycleEvent::SubAgentError,
            LifecycleEvent::SubAgentCancelled,
        ]
    }

    pub fn is_sub_agent(&self) -> bool {
        matches!(
            self,
            LifecycleEvent::SubAgentStart
                | LifecycleEvent::SubAgentComplete
                | LifecycleEvent::SubAgentSuspend
                | LifecycleEvent::SubAgentError
                | LifecycleEvent::SubAgentCancelled
        )
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleEvent::AgentStart => write!(f, "onAgentStart"),
            LifecycleEvent::AgentResume => write!(f, "onAgentResume"),
            LifecycleEvent::AgentComplete => write!(f, "onAgentComplete"),
            LifecycleEvent::AgentSuspend => write!(f, "onAgentSuspend"),
            LifecycleEvent::AgentError => write!(f, "onAgentError"),
            LifecycleEvent::AgentCancelled => write!(f, "onAgentCancelled"),
            LifecycleEvent::SubAgentStart => write!(f, "onSubAgentStart"),
            LifecycleEvent::SubAgentComplete => write!(f, "onSubAgentComplete"),
            LifecycleEvent::SubAgentSuspend => write!(f, "onSubAgentSuspend"),
            LifecycleEvent::SubAgentError => write!(f, "onSubAgentError"),
            LifecycleEvent::SubAgentCancelled => write!(f, "onSubAgentCancelled"),
        }
    }
}

/// The child run a `SubAgent*` event refers to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubAgentInfo {
    pub manifest: ManifestKey,
    pub state_id: StateId,
    pub tool_call_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HookInput {
    pub event: LifecycleEvent,
    /// The manifest whose hooks are being invoked.
    pub manifest: ManifestKey,
    pub state_id: StateId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_agent: Option<SubAgentInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<SuspensionStack>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HookInput {
    pub fn new(event: LifecycleEvent, manifest: ManifestKey, state_id: StateId) -> Self {
        Self {
            event,
            manifest,
            state_id,
            sub_agent: None,
            output: None,
            error: None,
            suspension: None,
            reason: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_sub_agent(mut self, info: SubAgentInfo) -> Self {
        self.sub_agent = Some(info);
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_error(mut self, error: AppError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_suspension(mut self, stack: SuspensionStack) -> Self {
        self.suspension = Some(stack);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    fn events(&self) -> &[LifecycleEvent];

    /// Overrides the manager's timeout for this hook.
    fn timeout_secs(&self) -> Option<u64> {
        None
    }

    /// Higher runs first.
    fn priority(&self) -> i32 {
        0
    }

    /// An `Err` fails the transition that triggered the hook.
    async fn execute(&self, input: HookInput) -> crate::Result<()>;
}

type HookFn = Arc<dyn Fn(HookInput) -> BoxFuture<'static, crate::Result<()>> + Send + Sync>;

/// Hook backed by an async closure.
pub struct FnHook {
    name: String,
    events: Vec<LifecycleEvent>,
    priority: i32,
    handler: HookFn,
}

impl FnHook {
    pub fn new<F, Fut>(name: impl Into<String>, events: &[LifecycleEvent], handler: F) -> Self
    where
        F: Fn(HookInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = crate::Result<()>> + Send + 'static,
    {
        Self {
            name: name.into(),
            events: events.to_vec(),
            priority: 0,
            handler: Arc::new(move |input| Box::pin(handler(input))),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[async_trait]
impl Hook for FnHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    async fn execute(&self, input: HookInput) -> crate::Result<()> {
        (self.handler)(input).await
    }
}
