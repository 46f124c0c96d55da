//! Lifecycle hooks for agents and their sub-agents.

mod manager;
mod traits;

pub use manager::{HookManager, HookRegistry};
pub use traits::{FnHook, Hook, HookInput, LifecycleEvent, SubAgentInfo};
