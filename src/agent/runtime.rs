//! The public entry point: run, stream, resume and cancel agents.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use super::cancellation::CancellationSignals;
use super::events::EventSink;
use super::{AgentRunResult, AgentState};
use crate::config::RuntimeConfig;
use crate::hooks::HookRegistry;
use crate::manifest::{ManifestKey, ManifestRegistry};
use crate::model::ModelClient;
use crate::observability::RuntimeMetrics;
use crate::store::{KeyValueStore, KvRepository, MemoryKeyValueStore};
use crate::suspension::ResolvedSuspension;
use crate::tools::{Tool, ToolRegistry};
use crate::types::{StateId, ToolChoice};

/// Per-invocation overrides for a new run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub state_id: Option<StateId>,
    pub user_id: Option<String>,
    pub timeout: Option<Duration>,
    pub tool_choice: Option<ToolChoice>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state_id(mut self, state_id: StateId) -> Self {
        self.state_id = Some(state_id);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = Some(choice);
        self
    }
}

/// Per-invocation overrides for a resumed run, applied to every level of the
/// stack. Unset fields keep the values persisted with each state.
#[derive(Debug, Clone, Default)]
pub struct ResumeOptions {
    pub user_id: Option<String>,
    pub timeout: Option<Duration>,
}

impl ResumeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Collaborators shared by every run of one runtime.
pub(crate) struct Engine {
    pub manifests: Arc<dyn ManifestRegistry>,
    pub tools: ToolRegistry,
    pub model: Arc<dyn ModelClient>,
    pub hooks: Arc<HookRegistry>,
    pub store: Arc<dyn KeyValueStore>,
    pub states: KvRepository<AgentState>,
    pub signals: CancellationSignals,
    pub config: RuntimeConfig,
    pub metrics: Arc<RuntimeMetrics>,
}

impl Engine {
    pub async fn load_state(&self, state_id: StateId) -> crate::Result<Option<AgentState>> {
        Ok(self.states.load(&state_id.to_string()).await?)
    }

    pub async fn require_state(&self, state_id: StateId) -> crate::Result<AgentState> {
        self.load_state(state_id)
            .await?
            .ok_or_else(|| crate::Error::not_found("agent state", state_id))
    }

    pub async fn save_state(&self, state: &AgentState) -> crate::Result<()> {
        Ok(self.states.save(state).await?)
    }
}

/// Runs agents against a manifest registry, a tool registry and a model.
///
/// Cheap to clone; clones share every collaborator.
#[derive(Clone)]
pub struct AgentRuntime {
    pub(crate) engine: Arc<Engine>,
}

impl AgentRuntime {
    pub fn builder() -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::default()
    }

    /// Runs a new root agent until it completes, suspends, fails or is cancelled.
    ///
    /// Failures before the run starts (unknown manifest or tool, reused state
    /// id) are returned as `Err`; failures during the run are reported as
    /// [`AgentRunResult::Error`] and persisted.
    #[instrument(skip(self, input, options), fields(manifest = %key))]
    pub async fn run_agent(
        &self,
        key: &ManifestKey,
        input: impl Into<String>,
        options: RunOptions,
    ) -> crate::Result<AgentRunResult> {
        self.engine
            .start_root(key, input.into(), options, &EventSink::disabled())
            .await
    }

    /// Continues a suspended root run with a decision for every pending approval.
    #[instrument(skip(self, resolved, options), fields(state_id = %state_id))]
    pub async fn resume_agent(
        &self,
        state_id: StateId,
        resolved: Vec<ResolvedSuspension>,
        options: ResumeOptions,
    ) -> crate::Result<AgentRunResult> {
        self.engine
            .resume(state_id, resolved, options, &EventSink::disabled())
            .await
    }

    /// Requests cancellation. Running states stop at their next step boundary;
    /// suspended states are cancelled immediately.
    pub async fn cancel_agent(&self, state_id: StateId, reason: impl Into<String>) -> crate::Result<()> {
        self.engine.cancel(state_id, reason.into()).await
    }

    pub async fn state(&self, state_id: StateId) -> crate::Result<Option<AgentState>> {
        self.engine.load_state(state_id).await
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.engine.hooks
    }

    pub fn metrics(&self) -> Arc<RuntimeMetrics> {
        Arc::clone(&self.engine.metrics)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.engine.config
    }

    pub fn signals(&self) -> &CancellationSignals {
        &self.engine.signals
    }
}

#[derive(Default)]
pub struct AgentRuntimeBuilder {
    manifests: Option<Arc<dyn ManifestRegistry>>,
    tools: ToolRegistry,
    model: Option<Arc<dyn ModelClient>>,
    hooks: Option<Arc<HookRegistry>>,
    store: Option<Arc<dyn KeyValueStore>>,
    config: Option<RuntimeConfig>,
    metrics: Option<Arc<RuntimeMetrics>>,
}

impl AgentRuntimeBuilder {
    pub fn manifests(mut self, registry: impl ManifestRegistry + 'static) -> Self {
        self.manifests = Some(Arc::new(registry));
        self
    }

    pub fn manifests_arc(mut self, registry: Arc<dyn ManifestRegistry>) -> Self {
        self.manifests = Some(registry);
        self
    }

    pub fn tool(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.register(Arc::new(tool));
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn model(mut self, model: impl ModelClient + 'static) -> Self {
        self.model = Some(Arc::new(model));
        self
    }

    pub fn model_arc(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn metrics(mut self, metrics: Arc<RuntimeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> crate::Result<AgentRuntime> {
        let manifests = self
            .manifests
            .ok_or_else(|| crate::Error::Config("a manifest registry is required".into()))?;
        let model = self
            .model
            .ok_or_else(|| crate::Error::Config("a model client is required".into()))?;
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryKeyValueStore::new()));
        let hooks = self
            .hooks
            .unwrap_or_else(|| Arc::new(HookRegistry::with_timeout(config.hook_timeout)));

        tracing::debug!(
            store = store.name(),
            tools = self.tools.len(),
            "Agent runtime built"
        );

        Ok(AgentRuntime {
            engine: Arc::new(Engine {
                manifests,
                tools: self.tools,
                model,
                hooks,
                states: KvRepository::new(Arc::clone(&store)).with_ttl(config.agent_state_ttl),
                signals: CancellationSignals::new(Arc::clone(&store), config.cancellation_signal_ttl),
                store,
                config,
                metrics: self.metrics.unwrap_or_default(),
            }),
        })
    }
}
