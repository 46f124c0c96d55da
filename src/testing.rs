//! Deterministic collaborators for tests: a scripted model client, simple
//! tools, recording hooks and a recording store.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::Mutex;

use crate::agent::CancellationSignals;
use crate::hooks::{Hook, HookInput, LifecycleEvent};
use crate::model::{CompletionRequest, ModelClient, ModelResponse};
use crate::store::{KeyValueStore, MemoryKeyValueStore, StoreError, StoreResult};
use crate::tools::{Tool, ToolContext, ToolOutput};

enum Scripted {
    Respond(ModelResponse),
    Fail(String),
}

/// Model client that replays queued responses per manifest id.
///
/// When a manifest's queue is empty the default response (plain text `"ok"`)
/// is returned. Clones share scripts and recorded requests.
#[derive(Clone)]
pub struct ScriptedModel {
    scripts: Arc<DashMap<String, VecDeque<Scripted>>>,
    default_response: ModelResponse,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            scripts: Arc::new(DashMap::new()),
            default_response: ModelResponse::text("ok"),
            delay: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queues responses for the agent with manifest id `agent`.
    pub fn script(self, agent: impl Into<String>, responses: impl IntoIterator<Item = ModelResponse>) -> Self {
        self.scripts
            .entry(agent.into())
            .or_default()
            .extend(responses.into_iter().map(Scripted::Respond));
        self
    }

    /// Queues a transport failure for the next call made for `agent`.
    pub fn fail_next(self, agent: impl Into<String>, message: impl Into<String>) -> Self {
        self.scripts
            .entry(agent.into())
            .or_default()
            .push_back(Scripted::Fail(message.into()));
        self
    }

    pub fn with_default(mut self, response: ModelResponse) -> Self {
        self.default_response = response;
        self
    }

    /// Sleeps before every response.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub async fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().await.clone()
    }

    /// Requests made for one manifest id, in order.
    pub async fn requests_for(&self, agent: &str) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .await
            .iter()
            .filter(|r| r.agent.id == agent)
            .cloned()
            .collect()
    }

    pub async fn call_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> crate::Result<ModelResponse> {
        let agent = request.agent.id.clone();
        self.requests.lock().await.push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self
            .scripts
            .get_mut(&agent)
            .and_then(|mut queue| queue.pop_front());
        match next {
            Some(Scripted::Respond(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(crate::Error::GatewayTimeout(message)),
            None => Ok(self.default_response.clone()),
        }
    }
}

/// Tool returning a fixed output and counting its calls.
#[derive(Clone)]
pub struct StaticTool {
    name: String,
    output: String,
    calls: Arc<AtomicUsize>,
}

impl StaticTool {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            output: output.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed result"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> ToolOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ToolOutput::success(&self.output)
    }
}

/// Tool that must be approved before every call.
#[derive(Clone)]
pub struct ApprovalGatedTool {
    inner: StaticTool,
}

impl ApprovalGatedTool {
    pub fn new(name: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            inner: StaticTool::new(name, output),
        }
    }

    pub fn calls(&self) -> usize {
        self.inner.calls()
    }
}

#[async_trait]
impl Tool for ApprovalGatedTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        "Performs a sensitive action"
    }

    fn input_schema(&self) -> Value {
        self.inner.input_schema()
    }

    fn requires_approval(&self, _input: &Value) -> bool {
        true
    }

    fn approval_description(&self, input: &Value) -> Option<String> {
        Some(format!("Run {} with {}", self.inner.name(), input))
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> ToolOutput {
        self.inner.execute(input, context).await
    }
}

/// Tool that always fails; optionally fatal to the run.
#[derive(Clone)]
pub struct FailingTool {
    name: String,
    message: String,
    fatal: bool,
}

impl FailingTool {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            fatal: false,
        }
    }

    pub fn fatal(mut self) -> Self {
        self.fatal = true;
        self
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    fn is_fatal(&self) -> bool {
        self.fatal
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> ToolOutput {
        ToolOutput::error(&self.message)
    }
}

/// Tool that sleeps before returning.
#[derive(Clone)]
pub struct SlowTool {
    name: String,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: impl Into<String>, delay: Duration) -> Self {
        Self {
            name: name.into(),
            delay,
        }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Takes a while"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> ToolOutput {
        tokio::time::sleep(self.delay).await;
        ToolOutput::success("done")
    }
}

/// Tool that raises a cancellation signal for the run that calls it.
///
/// Lets tests observe cancellation at the following step boundary.
#[derive(Clone)]
pub struct CancelOnExecuteTool {
    name: String,
    signals: CancellationSignals,
}

impl CancelOnExecuteTool {
    pub fn new(name: impl Into<String>, signals: CancellationSignals) -> Self {
        Self {
            name: name.into(),
            signals,
        }
    }
}

#[async_trait]
impl Tool for CancelOnExecuteTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Requests cancellation of the calling run"
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object"})
    }

    async fn execute(&self, _input: Value, context: &ToolContext) -> ToolOutput {
        match self.signals.signal(context.state_id, "cancelled by tool").await {
            Ok(()) => ToolOutput::success("cancellation requested"),
            Err(e) => ToolOutput::error(e.to_string()),
        }
    }
}

/// Hook that records every input it receives.
#[derive(Clone)]
pub struct RecordingHook {
    name: String,
    inputs: Arc<Mutex<Vec<HookInput>>>,
}

impl RecordingHook {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub async fn recorded(&self) -> Vec<LifecycleEvent> {
        self.inputs.lock().await.iter().map(|i| i.event).collect()
    }

    pub async fn inputs(&self) -> Vec<HookInput> {
        self.inputs.lock().await.clone()
    }
}

#[async_trait]
impl Hook for RecordingHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn events(&self) -> &[LifecycleEvent] {
        LifecycleEvent::all()
    }

    async fn execute(&self, input: HookInput) -> crate::Result<()> {
        self.inputs.lock().await.push(input);
        Ok(())
    }
}

/// Hook that fails on the given events.
#[derive(Clone)]
pub struct FailingHook {
    name: String,
    events: Vec<LifecycleEvent>,
}

impl FailingHook {
    pub fn new(name: impl Into<String>, events: &[LifecycleEvent]) -> Self {
        Self {
            name: name.into(),
            events: events.to_vec(),
        }
    }
}

#[async_trait]
impl Hook for FailingHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn events(&self) -> &[LifecycleEvent] {
        &self.events
    }

    async fn execute(&self, input: HookInput) -> crate::Result<()> {
        Err(crate::Error::InternalServer(format!(
            "{} rejected {}",
            self.name, input.event
        )))
    }
}

/// In-memory store that records every write and refuses writes to blocked keys.
#[derive(Clone, Default)]
pub struct RecordingStore {
    inner: MemoryKeyValueStore,
    writes: Arc<Mutex<Vec<(String, String)>>>,
    blocked: Arc<Mutex<HashSet<String>>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `set` or `set_if_absent` on `key` fail.
    pub async fn block(&self, key: impl Into<String>) {
        self.blocked.lock().await.insert(key.into());
    }

    /// Values written to `key`, oldest first.
    pub async fn writes_to(&self, key: &str) -> Vec<String> {
        self.writes
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect()
    }

    async fn admit(&self, key: &str, value: &str) -> StoreResult<()> {
        if self.blocked.lock().await.contains(key) {
            return Err(StoreError::Storage {
                message: format!("write to {} refused", key),
            });
        }
        self.writes
            .lock()
            .await
            .push((key.to_string(), value.to_string()));
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for RecordingStore {
    fn name(&self) -> &str {
        "recording"
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.admit(key, value).await?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.admit(key, value).await?;
        self.inner.set_if_absent(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.inner.delete(key).await
    }
}
