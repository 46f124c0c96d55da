//! The step loop.
//!
//! One loop instance owns one [`AgentRunState`]. Each iteration checks for
//! cancellation and timeout, asks the model for a step unless tool calls of the
//! previous step are still unsettled, settles tool calls, and evaluates the
//! stop policy. State is written when the run starts and when it leaves the
//! loop, never mid-step.

use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};

use super::cancellation::CancellationMonitor;
use super::events::EventSink;
use super::output::{correction_message, validate_output};
use super::runtime::{Engine, RunOptions};
use super::stop::should_stop;
use super::{AgentEvent, AgentOutput, AgentRunResult, AgentRunState, AgentStatus, StepResult};
use crate::AppError;
use crate::hooks::{HookInput, LifecycleEvent};
use crate::manifest::ManifestKey;
use crate::model::CompletionRequest;
use crate::suspension::{Suspension, SuspensionStack};
use crate::tools::{ToolContext, ToolOutput};
use crate::types::{
    ApprovalId, ContentBlock, Message, ToolApprovalRequestBlock, ToolCallBlock, ToolResultBlock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunEntry {
    Start,
    Resume,
}

impl RunEntry {
    fn event(self) -> LifecycleEvent {
        match self {
            RunEntry::Start => LifecycleEvent::AgentStart,
            RunEntry::Resume => LifecycleEvent::AgentResume,
        }
    }
}

pub(crate) enum LoopOutcome {
    Complete(AgentOutput),
    Suspended(SuspensionStack),
    Cancelled(String),
    Failed(crate::Error),
}

pub(crate) enum Settlement {
    Settled,
    Suspended(SuspensionStack),
    Cancelled(String),
}

impl Engine {
    pub(crate) async fn start_root(
        &self,
        key: &ManifestKey,
        input: String,
        options: RunOptions,
        sink: &EventSink,
    ) -> crate::Result<AgentRunResult> {
        let manifest = self.manifests.resolve(key).await?;
        let tools = self.tools.select(&manifest.tools)?;

        let state_id = options.state_id.unwrap_or_default();
        if let Some(existing) = self.load_state(state_id).await? {
            return Err(crate::Error::invalid_state(
                state_id,
                "unused state id",
                existing.status,
            ));
        }

        let timeout = options
            .timeout
            .or(manifest.timeout_ms.map(Duration::from_millis))
            .unwrap_or(self.config.agent_timeout);
        let mut run = AgentRunState::new(state_id, manifest, tools, timeout).with_user(options.user_id);
        if let Some(choice) = options.tool_choice {
            run.tool_choice = choice;
        }
        run.messages.push(Message::user(input));

        self.execute_run(run, RunEntry::Start, sink).await
    }

    /// Drives `run` to an outcome and persists it.
    #[instrument(skip_all, fields(state_id = %run.state_id, manifest = %run.key()))]
    pub(crate) async fn execute_run(
        &self,
        mut run: AgentRunState,
        entry: RunEntry,
        sink: &EventSink,
    ) -> crate::Result<AgentRunResult> {
        self.save_state(&run.snapshot(AgentStatus::Running)).await?;
        match entry {
            RunEntry::Start => {
                self.metrics.runs_started.inc();
                info!(parent = run.parent.is_some(), "Agent run started");
            }
            RunEntry::Resume => {
                self.metrics.runs_resumed.inc();
                info!(step = run.step_number, "Agent run resumed");
            }
        }
        self.metrics.active_runs.inc();

        let key = run.key();
        let event = entry.event();
        let outcome = match self
            .hooks
            .dispatch(&key, event, HookInput::new(event, key.clone(), run.state_id))
            .await
        {
            Ok(()) => match self.drive(&mut run, sink).await {
                Ok(outcome) => outcome,
                Err(e) => LoopOutcome::Failed(e),
            },
            Err(e) => LoopOutcome::Failed(e),
        };

        let result = self.finish(&run, outcome).await;
        self.metrics.active_runs.dec();
        result
    }

    async fn drive(&self, run: &mut AgentRunState, sink: &EventSink) -> crate::Result<LoopOutcome> {
        let mut monitor = CancellationMonitor::new(
            self.signals.clone(),
            run.cancel_scope(),
            self.config.cancellation_poll_interval,
        );

        loop {
            if let Some(signal) = monitor.poll().await? {
                return Ok(LoopOutcome::Cancelled(signal.reason));
            }
            if run.is_timed_out() {
                return Err(crate::Error::Timeout(run.timeout()));
            }

            let started = Instant::now();
            if !run.has_pending_tool_calls() {
                self.model_step(run, sink).await?;

                let approvals = run.unresolved_approvals();
                if !approvals.is_empty() {
                    let suspensions = approvals.iter().map(Suspension::from).collect();
                    return Ok(LoopOutcome::Suspended(SuspensionStack::leaf(
                        &run.key(),
                        run.state_id,
                        suspensions,
                    )));
                }
            }

            match self.settle_tool_calls(run, sink).await? {
                Settlement::Settled => {}
                Settlement::Suspended(stack) => return Ok(LoopOutcome::Suspended(stack)),
                Settlement::Cancelled(reason) => return Ok(LoopOutcome::Cancelled(reason)),
            }
            self.metrics
                .record_step(started.elapsed().as_secs_f64() * 1000.0);

            if let Some(step) = run.steps.last() {
                sink.emit(AgentEvent::StepFinished {
                    state_id: run.state_id,
                    step_number: step.step_number,
                    finish_reason: step.finish_reason,
                });
            }

            if let Some(output) = self.check_completion(run)? {
                return Ok(LoopOutcome::Complete(output));
            }
        }
    }

    async fn model_step(&self, run: &mut AgentRunState, sink: &EventSink) -> crate::Result<()> {
        run.step_number += 1;
        let step = run.step_number;
        sink.emit(AgentEvent::StepStarted {
            state_id: run.state_id,
            step_number: step,
        });

        let request = CompletionRequest {
            agent: run.key(),
            system: run.manifest.instructions.clone(),
            messages: run.messages.clone(),
            tools: run.tool_definitions(),
            tool_choice: run.tool_choice.clone(),
        };
        let response = self.model.complete(request).await?;

        let mut approvals = response.approval_requests;
        for call in &response.tool_calls {
            if approvals.iter().any(|a| a.tool_call_id == call.id) {
                continue;
            }
            if let Some(tool) = run.tools.get(&call.name)
                && tool.requires_approval(&call.input)
            {
                approvals.push(ToolApprovalRequestBlock {
                    approval_id: ApprovalId::new(),
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    args: call.input.clone(),
                    description: tool.approval_description(&call.input),
                });
            }
        }

        let mut content = Vec::with_capacity(1 + response.tool_calls.len() + approvals.len());
        if !response.text.is_empty() {
            sink.emit(AgentEvent::Text {
                state_id: run.state_id,
                text: response.text.clone(),
            });
            content.push(ContentBlock::text(&response.text));
        }
        for call in &response.tool_calls {
            sink.emit(AgentEvent::ToolCall {
                state_id: run.state_id,
                call: call.clone(),
            });
            content.push(ContentBlock::ToolCall(call.clone()));
        }
        content.extend(approvals.into_iter().map(ContentBlock::ToolApprovalRequest));
        run.messages.push(Message::assistant(content));

        debug!(
            step,
            tool_calls = response.tool_calls.len(),
            finish_reason = ?response.finish_reason,
            "Model step completed"
        );
        run.steps.push(StepResult {
            step_number: step,
            text: response.text,
            tool_calls: response.tool_calls,
            tool_results: Vec::new(),
            finish_reason: response.finish_reason,
        });
        Ok(())
    }

    /// Settles every tool call of the latest assistant message that has no result yet.
    async fn settle_tool_calls(
        &self,
        run: &mut AgentRunState,
        sink: &EventSink,
    ) -> crate::Result<Settlement> {
        for call in run.pending_tool_calls() {
            if let Some(request) = run.approval_request_for(&call.id).cloned() {
                let Some(response) = run.approval_response_for(&request.approval_id).cloned() else {
                    return Err(crate::Error::invalid_state(
                        run.state_id,
                        format!("a response to approval {}", request.approval_id),
                        "none",
                    ));
                };
                if !response.approved {
                    let reason = response
                        .reason
                        .unwrap_or_else(|| "no reason given".to_string());
                    debug!(tool = %call.name, %reason, "Tool call denied");
                    let result = ToolResultBlock::error(
                        &call.id,
                        &call.name,
                        format!("Tool execution denied: {}", reason),
                    );
                    self.record_result(run, result, sink);
                    continue;
                }
            }

            if let Some(sub) = run.manifest.sub_agent(&call.name).cloned() {
                let child = match run.take_resumed_child(&call.id) {
                    Some(result) => result,
                    None => self.run_child(run, &sub, &call, sink).await?,
                };
                match self.absorb_child(run, &sub, &call, child, sink).await? {
                    Settlement::Settled => continue,
                    other => return Ok(other),
                }
            }

            let result = self.execute_tool(run, &call).await?;
            self.record_result(run, result, sink);
        }
        Ok(Settlement::Settled)
    }

    async fn execute_tool(
        &self,
        run: &AgentRunState,
        call: &ToolCallBlock,
    ) -> crate::Result<ToolResultBlock> {
        let Some(tool) = run.tools.get(&call.name).cloned() else {
            warn!(tool = %call.name, "Model called an unknown tool");
            return Ok(ToolResultBlock::error(
                &call.id,
                &call.name,
                format!("Unknown tool '{}'", call.name),
            ));
        };

        let context = ToolContext::new(run.state_id, run.key(), &call.id)
            .with_step(run.step_number)
            .with_user(run.user_id.clone());
        match tool.execute(call.input.clone(), &context).await {
            ToolOutput::Success(content) => {
                Ok(ToolResultBlock::success(&call.id, &call.name, content))
            }
            ToolOutput::Error(message) if tool.is_fatal() => Err(crate::Error::InternalServer(
                format!("fatal tool '{}' failed: {}", call.name, message),
            )),
            ToolOutput::Error(message) => {
                debug!(tool = %call.name, error = %message, "Tool returned an error");
                Ok(ToolResultBlock::error(&call.id, &call.name, message))
            }
        }
    }

    pub(crate) fn record_result(
        &self,
        run: &mut AgentRunState,
        result: ToolResultBlock,
        sink: &EventSink,
    ) {
        sink.emit(AgentEvent::ToolResult {
            state_id: run.state_id,
            result: result.clone(),
        });
        run.record_tool_result(result);
    }

    /// Returns the final output once the stop policy fires and the answer is acceptable.
    fn check_completion(&self, run: &mut AgentRunState) -> crate::Result<Option<AgentOutput>> {
        let Some(last) = run.steps.last() else {
            return Ok(None);
        };
        if !should_stop(
            &run.manifest,
            run.step_number,
            &run.steps,
            Some(last.finish_reason),
            self.config.default_max_steps,
        ) {
            return Ok(None);
        }

        let text = last.text.clone();
        let steps = run.step_number;
        let Some(spec) = run.manifest.output.clone() else {
            return Ok(Some(AgentOutput {
                text,
                value: None,
                steps,
            }));
        };

        match validate_output(&spec, &text) {
            Ok(value) => Ok(Some(AgentOutput {
                text,
                value: Some(value),
                steps,
            })),
            Err(problem) => {
                if run.output_validation_retries >= self.config.max_output_validation_retries {
                    return Err(crate::Error::validation("output", problem));
                }
                run.output_validation_retries += 1;
                debug!(
                    retry = run.output_validation_retries,
                    %problem,
                    "Final answer rejected, asking for a corrected one"
                );
                run.messages.push(correction_message(&spec, &problem));
                Ok(None)
            }
        }
    }

    /// Fires the run's own lifecycle hook and persists the outcome.
    ///
    /// Complete and suspend hooks run before the terminal status is written, so
    /// a failing one turns the outcome into an error stored exactly once.
    async fn finish(
        &self,
        run: &AgentRunState,
        mut outcome: LoopOutcome,
    ) -> crate::Result<AgentRunResult> {
        let key = run.key();
        let state_id = run.state_id;

        loop {
            match outcome {
                LoopOutcome::Complete(output) => {
                    let event = LifecycleEvent::AgentComplete;
                    let input = HookInput::new(event, key.clone(), state_id).with_output(&output.text);
                    if let Err(e) = self.hooks.dispatch(&key, event, input).await {
                        outcome = LoopOutcome::Failed(e);
                        continue;
                    }
                    let mut state = run.snapshot(AgentStatus::Complete);
                    state.output = Some(output.clone());
                    self.save_state(&state).await?;
                    self.metrics.runs_completed.inc();
                    info!(steps = output.steps, "Agent run completed");
                    return Ok(AgentRunResult::Complete { state_id, output });
                }
                LoopOutcome::Suspended(stack) => {
                    let event = LifecycleEvent::AgentSuspend;
                    let input =
                        HookInput::new(event, key.clone(), state_id).with_suspension(stack.clone());
                    if let Err(e) = self.hooks.dispatch(&key, event, input).await {
                        outcome = LoopOutcome::Failed(e);
                        continue;
                    }
                    let mut state = run.snapshot(AgentStatus::Suspended);
                    state.suspension = Some(stack.clone());
                    self.save_state(&state).await?;
                    self.metrics.runs_suspended.inc();
                    info!(
                        step = run.step_number,
                        depth = stack.depth(),
                        approvals = stack.leaf.suspensions.len(),
                        "Agent run suspended"
                    );
                    return Ok(AgentRunResult::Suspended {
                        state_id,
                        suspension: stack,
                    });
                }
                LoopOutcome::Cancelled(reason) => {
                    let mut state = run.snapshot(AgentStatus::Cancelled);
                    state.cancel_reason = Some(reason.clone());
                    self.save_state(&state).await?;

                    let event = LifecycleEvent::AgentCancelled;
                    let input = HookInput::new(event, key.clone(), state_id).with_reason(&reason);
                    if let Err(e) = self.hooks.dispatch(&key, event, input).await {
                        warn!(error = %e, "Cancellation hook failed");
                    }
                    self.metrics.runs_cancelled.inc();
                    info!(%reason, "Agent run cancelled");
                    return Ok(AgentRunResult::Cancelled { state_id, reason });
                }
                LoopOutcome::Failed(error) => {
                    let app_error = AppError::from(&error);
                    let mut state = run.snapshot(AgentStatus::Error);
                    state.error = Some(app_error.clone());
                    self.save_state(&state).await?;

                    let event = LifecycleEvent::AgentError;
                    let input =
                        HookInput::new(event, key.clone(), state_id).with_error(app_error.clone());
                    if let Err(e) = self.hooks.dispatch(&key, event, input).await {
                        warn!(error = %e, "Error hook failed");
                    }
                    self.metrics.runs_failed.inc();
                    warn!(code = %app_error.code, error = %error, "Agent run failed");
                    return Ok(AgentRunResult::Error {
                        state_id,
                        error: app_error,
                    });
                }
            }
        }
    }
}
