//! Agent execution: the step loop, suspension and resume, sub-agents and
//! cancellation, behind the [`AgentRuntime`] facade.

mod cancellation;
mod events;
mod execution;
mod output;
mod resume;
mod runtime;
mod state;
mod stop;
mod streaming;
mod subagent;

pub use cancellation::{CancelSignal, CancellationMonitor, CancellationSignals};
pub use events::{AgentEvent, AgentOutput, AgentRunResult};
pub use output::validate_output;
pub use runtime::{AgentRuntime, AgentRuntimeBuilder, ResumeOptions, RunOptions};
pub use state::{AgentRunState, AgentState, AgentStatus, ParentAgentContext, StepResult};
pub use stop::{DEFAULT_MAX_STEPS, should_stop};
