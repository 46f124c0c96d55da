//! Agent manifests: immutable per-agent configuration.

mod registry;

pub use registry::{InMemoryManifestRegistry, ManifestRegistry};

use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::types::{ParseIdError, ToolChoice, ToolDefinition};

/// `id:version` lookup key for a manifest.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestKey {
    pub id: String,
    pub version: String,
}

impl ManifestKey {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.id, self.version)
    }
}

impl FromStr for ManifestKey {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((id, version)) if !id.is_empty() && !version.is_empty() => {
                Ok(Self::new(id, version))
            }
            _ => Err(ParseIdError {
                kind: "manifest",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopCondition {
    /// Stop once `step_number >= step_count`.
    StepCount { step_count: u32 },
    /// Stop once any step has called the named tool.
    ToolUse { name: String },
}

impl StopCondition {
    pub fn step_count(step_count: u32) -> Self {
        Self::StepCount { step_count }
    }

    pub fn tool_use(name: impl Into<String>) -> Self {
        Self::ToolUse { name: name.into() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnTextOnly {
    Stop,
    #[default]
    Continue,
}

/// A child agent exposed to the parent model as a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubAgentRef {
    pub id: String,
    pub version: String,
    pub tool_name: String,
    pub description: String,
}

impl SubAgentRef {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            tool_name: id.clone(),
            description: format!("Delegate a task to the {} agent", id),
            id,
            version: version.into(),
        }
    }

    pub fn tool_name(mut self, name: impl Into<String>) -> Self {
        self.tool_name = name.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn key(&self) -> ManifestKey {
        ManifestKey::new(&self.id, &self.version)
    }

    pub fn definition(&self) -> ToolDefinition {
        let schema = schemars::schema_for!(SubAgentInput);
        ToolDefinition::new(
            &self.tool_name,
            &self.description,
            serde_json::to_value(schema).unwrap_or_default(),
        )
    }
}

/// Arguments of a sub-agent tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SubAgentInput {
    /// The task handed to the sub-agent.
    pub input: String,
}

/// Required shape of the final answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Top-level keys the JSON answer must contain.
    #[serde(default)]
    pub required: Vec<String>,
}

impl OutputSpec {
    pub fn json(required: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            required: required.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentManifest {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// Tool names resolved against the runtime's tool registry.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub stop_when: Vec<StopCondition>,
    #[serde(default)]
    pub on_text_only: OnTextOnly,
    #[serde(default)]
    pub sub_agents: Vec<SubAgentRef>,
    #[serde(default)]
    pub tool_choice: ToolChoice,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<OutputSpec>,
    /// Overrides the runtime's wall-clock ceiling for this agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl AgentManifest {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
            description: String::new(),
            instructions: None,
            tools: Vec::new(),
            stop_when: Vec::new(),
            on_text_only: OnTextOnly::default(),
            sub_agents: Vec::new(),
            tool_choice: ToolChoice::default(),
            output: None,
            timeout_ms: None,
        }
    }

    pub fn key(&self) -> ManifestKey {
        ManifestKey::new(&self.id, &self.version)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.tools.push(name.into());
        self
    }

    pub fn with_tools(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tools.extend(names.into_iter().map(Into::into));
        self
    }

    pub fn stop_when(mut self, condition: StopCondition) -> Self {
        self.stop_when.push(condition);
        self
    }

    pub fn on_text_only(mut self, policy: OnTextOnly) -> Self {
        self.on_text_only = policy;
        self
    }

    pub fn with_sub_agent(mut self, sub_agent: SubAgentRef) -> Self {
        self.sub_agents.push(sub_agent);
        self
    }

    pub fn with_tool_choice(mut self, choice: ToolChoice) -> Self {
        self.tool_choice = choice;
        self
    }

    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn sub_agent(&self, tool_name: &str) -> Option<&SubAgentRef> {
        self.sub_agents.iter().find(|s| s.tool_name == tool_name)
    }
}
