//! Tool trait definitions.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::context::ToolContext;
use crate::types::ToolDefinition;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutput {
    Success(String),
    Error(String),
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self::Success(content.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn content(&self) -> &str {
        match self {
            Self::Success(s) | Self::Error(s) => s,
        }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    fn input_schema(&self) -> Value;
    async fn execute(&self, input: Value, context: &ToolContext) -> ToolOutput;

    /// Whether this call must be approved by a human before it runs.
    fn requires_approval(&self, _input: &Value) -> bool {
        false
    }

    /// Text shown to the approver.
    fn approval_description(&self, _input: &Value) -> Option<String> {
        None
    }

    /// A failing fatal tool aborts the whole run instead of reporting an error result.
    fn is_fatal(&self) -> bool {
        false
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.input_schema())
    }
}

/// Tool with typed input and a schema derived via schemars.
#[async_trait]
pub trait SchemaTool: Send + Sync {
    type Input: JsonSchema + DeserializeOwned + Send;
    const NAME: &'static str;
    const DESCRIPTION: &'static str;
    const REQUIRES_APPROVAL: bool = false;

    async fn handle(&self, input: Self::Input, context: &ToolContext) -> ToolOutput;

    fn input_schema() -> Value {
        let schema = schemars::schema_for!(Self::Input);
        let mut value =
            serde_json::to_value(schema).unwrap_or_else(|_| serde_json::json!({"type": "object"}));

        if let Some(obj) = value.as_object_mut()
            && !obj.contains_key("properties")
        {
            obj.insert("properties".to_string(), Value::Object(serde_json::Map::new()));
        }

        value
    }
}

#[async_trait]
impl<T: SchemaTool + 'static> Tool for T {
    fn name(&self) -> &str {
        T::NAME
    }

    fn description(&self) -> &str {
        T::DESCRIPTION
    }

    fn input_schema(&self) -> Value {
        T::input_schema()
    }

    fn requires_approval(&self, _input: &Value) -> bool {
        T::REQUIRES_APPROVAL
    }

    async fn execute(&self, input: Value, context: &ToolContext) -> ToolOutput {
        match serde_json::from_value::<T::Input>(input) {
            Ok(typed) => SchemaTool::handle(self, typed, context).await,
            Err(e) => ToolOutput::error(format!("Invalid input: {}", e)),
        }
    }
}
