//! Resuming and cancelling persisted runs.

use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::events::EventSink;
use super::execution::RunEntry;
use super::runtime::{Engine, ResumeOptions};
use super::state::ResumedChild;
use super::{AgentRunResult, AgentRunState, AgentState, AgentStatus};
use crate::AppError;
use crate::hooks::{HookInput, LifecycleEvent};
use crate::suspension::{ResolvedSuspension, SuspensionStack, validate_resolutions};
use crate::types::{Message, StateId};

fn lock_key(state_id: StateId) -> String {
    format!("agent:lock:{}", state_id)
}

impl Engine {
    pub(crate) async fn resume(
        &self,
        state_id: StateId,
        resolved: Vec<ResolvedSuspension>,
        options: ResumeOptions,
        sink: &EventSink,
    ) -> crate::Result<AgentRunResult> {
        let key = lock_key(state_id);
        let token = Uuid::new_v4().to_string();
        if !self
            .store
            .set_if_absent(&key, &token, Some(self.config.agent_run_lock_ttl))
            .await?
        {
            return Err(crate::Error::invalid_state(
                state_id,
                "suspended",
                "resume in progress",
            ));
        }

        let result = self.resume_locked(state_id, resolved, &options, sink).await;
        if let Err(e) = self.store.delete(&key).await {
            warn!(%state_id, error = %e, "Failed to release run lock");
        }
        result
    }

    async fn resume_locked(
        &self,
        state_id: StateId,
        resolved: Vec<ResolvedSuspension>,
        options: &ResumeOptions,
        sink: &EventSink,
    ) -> crate::Result<AgentRunResult> {
        let mut root = self.require_state(state_id).await?;
        if root.status != AgentStatus::Suspended {
            return Err(crate::Error::invalid_state(state_id, AgentStatus::Suspended, root.status));
        }
        if !root.is_root() {
            return Err(crate::Error::invalid_state(state_id, "root agent state", "sub-agent state"));
        }
        let stack = root
            .suspension
            .clone()
            .ok_or_else(|| crate::Error::invalid_state(state_id, "suspension stack", "none"))?;
        validate_resolutions(&stack.leaf, &resolved)?;

        // Every level is loaded, checked and rehydrated before anything is written.
        let mut levels = vec![root.clone()];
        for id in stack
            .entries
            .iter()
            .skip(1)
            .map(|e| e.state_id)
            .chain((stack.depth() > 0).then_some(stack.leaf.state_id))
        {
            let state = self.require_state(id).await?;
            if state.status != AgentStatus::Suspended {
                return Err(crate::Error::invalid_state(id, AgentStatus::Suspended, state.status));
            }
            levels.push(state);
        }
        let level_ids: Vec<StateId> = levels.iter().map(|s| s.id).collect();
        let runs = self.rehydrate_levels(levels, options).await?;

        root.transition(AgentStatus::Running);
        self.save_state(&root).await?;

        info!(
            %state_id,
            depth = stack.depth(),
            resolved = resolved.len(),
            "Resuming suspended run"
        );
        match self.resume_stack(&stack, runs, resolved, sink).await {
            Ok(result) => Ok(result),
            Err(error) => {
                self.abandon_resume(&level_ids, &error).await;
                Err(error)
            }
        }
    }

    /// Builds run state for each level, root first. Level `i` gets levels
    /// `0..i` as its ancestors.
    async fn rehydrate_levels(
        &self,
        levels: Vec<AgentState>,
        options: &ResumeOptions,
    ) -> crate::Result<Vec<AgentRunState>> {
        let mut ancestors = Vec::with_capacity(levels.len());
        let mut runs = Vec::with_capacity(levels.len());
        for state in levels {
            let id = state.id;
            let manifest = self.manifests.resolve(&state.manifest()).await?;
            let tools = self.tools.select(&manifest.tools)?;
            let mut run = AgentRunState::from_state(state, manifest, tools, ancestors.clone());
            if let Some(timeout) = options.timeout {
                run = run.with_timeout(timeout);
            }
            if let Some(user_id) = &options.user_id {
                run.user_id = Some(user_id.clone());
            }
            runs.push(run);
            ancestors.push(id);
        }
        Ok(runs)
    }

    /// Resumes the leaf, then each ancestor with its child's outcome.
    #[instrument(skip_all, fields(root = %stack.root_state_id()))]
    async fn resume_stack(
        &self,
        stack: &SuspensionStack,
        mut runs: Vec<AgentRunState>,
        resolved: Vec<ResolvedSuspension>,
        sink: &EventSink,
    ) -> crate::Result<AgentRunResult> {
        let Some(mut run) = runs.pop() else {
            return Err(crate::Error::invalid_state(
                stack.leaf.state_id,
                "suspended state",
                "none",
            ));
        };
        for resolution in resolved {
            let ResolvedSuspension::ToolApproval {
                approval_id,
                approved,
                reason,
            } = resolution;
            run.messages
                .push(Message::approval_response(approval_id, approved, reason));
        }
        let mut result = self.execute_run(run, RunEntry::Resume, sink).await?;

        while let Some(mut run) = runs.pop() {
            let entry = &stack.entries[runs.len()];
            run.resumed_child = Some(ResumedChild {
                tool_call_id: entry.pending_tool_call_id.clone(),
                result,
            });
            result = self.execute_run(run, RunEntry::Resume, sink).await?;
        }
        Ok(result)
    }

    /// Moves levels a failed resume left `running` to `error`, so the run can
    /// be inspected instead of looking alive with no loop behind it.
    async fn abandon_resume(&self, level_ids: &[StateId], error: &crate::Error) {
        let app_error = AppError::from(error);
        for &id in level_ids {
            let mut state = match self.load_state(id).await {
                Ok(Some(state)) if state.status == AgentStatus::Running => state,
                Ok(_) => continue,
                Err(e) => {
                    warn!(state_id = %id, error = %e, "Failed to load state after resume failure");
                    continue;
                }
            };
            state.suspension = None;
            state.error = Some(app_error.clone());
            state.transition(AgentStatus::Error);
            if let Err(e) = self.save_state(&state).await {
                warn!(state_id = %id, error = %e, "Failed to record resume failure");
            }
        }
        self.metrics.runs_failed.inc();
        warn!(root = ?level_ids.first(), error = %error, "Resume failed");
    }

    pub(crate) async fn cancel(&self, state_id: StateId, reason: String) -> crate::Result<()> {
        let mut state = self.require_state(state_id).await?;
        match state.status {
            AgentStatus::Running => {
                self.signals.signal(state_id, &reason).await?;
                info!(%state_id, %reason, "Cancellation requested");
                Ok(())
            }
            AgentStatus::Suspended => {
                if !state.is_root() {
                    return Err(crate::Error::invalid_state(
                        state_id,
                        "root agent state",
                        "sub-agent state",
                    ));
                }
                if let Some(stack) = state.suspension.take() {
                    let descendants = stack
                        .entries
                        .iter()
                        .skip(1)
                        .map(|e| e.state_id)
                        .chain((stack.depth() > 0).then_some(stack.leaf.state_id));
                    for id in descendants {
                        if let Some(mut child) = self.load_state(id).await? {
                            child.suspension = None;
                            child.cancel_reason = Some(reason.clone());
                            child.transition(AgentStatus::Cancelled);
                            self.save_state(&child).await?;
                        }
                    }
                }
                state.cancel_reason = Some(reason.clone());
                state.transition(AgentStatus::Cancelled);
                self.save_state(&state).await?;

                let key = state.manifest();
                let event = LifecycleEvent::AgentCancelled;
                let input = HookInput::new(event, key.clone(), state_id).with_reason(&reason);
                if let Err(e) = self.hooks.dispatch(&key, event, input).await {
                    warn!(%state_id, error = %e, "Cancellation hook failed");
                }
                self.metrics.runs_cancelled.inc();
                info!(%state_id, %reason, "Suspended run cancelled");
                Ok(())
            }
            status => Err(crate::Error::invalid_state(
                state_id,
                "running or suspended",
                status,
            )),
        }
    }
}
