//! Stop policy evaluated after every finished step.

use super::StepResult;
use crate::manifest::{AgentManifest, OnTextOnly, StopCondition};
use crate::model::FinishReason;

/// Step ceiling applied when a manifest configures no stop conditions.
pub const DEFAULT_MAX_STEPS: u32 = 20;

impl StopCondition {
    pub fn is_met(&self, step_number: u32, steps: &[StepResult]) -> bool {
        match self {
            StopCondition::StepCount { step_count } => step_number >= *step_count,
            StopCondition::ToolUse { name } => steps.iter().any(|s| s.called_tool(name)),
        }
    }
}

/// Whether the loop stops after `step_number`.
///
/// Without `stop_when` the run stops at `default_max_steps`; otherwise the
/// conditions are checked in declaration order and the first match stops.
/// `OnTextOnly::Stop` also stops once the model finishes with
/// [`FinishReason::Stop`].
pub fn should_stop(
    manifest: &AgentManifest,
    step_number: u32,
    steps: &[StepResult],
    finish_reason: Option<FinishReason>,
    default_max_steps: u32,
) -> bool {
    let by_condition = if manifest.stop_when.is_empty() {
        step_number >= default_max_steps
    } else {
        manifest
            .stop_when
            .iter()
            .any(|c| c.is_met(step_number, steps))
    };

    by_condition
        || (manifest.on_text_only == OnTextOnly::Stop && finish_reason == Some(FinishReason::Stop))
}
