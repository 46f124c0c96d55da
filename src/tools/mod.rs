//! Tools callable by agents.

mod context;
mod registry;
mod traits;

pub use context::ToolContext;
pub use registry::ToolRegistry;
pub use traits::{SchemaTool, Tool, ToolOutput};
