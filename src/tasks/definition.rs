//! Task definitions: name, target queue, retry policy and payload validator.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

type Validator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

pub const DEFAULT_QUEUE: &str = "default";
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub queue: String,
    pub max_attempts: u32,
    pub priority: i32,
    validator: Option<Validator>,
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("name", &self.name)
            .field("queue", &self.queue)
            .field("max_attempts", &self.max_attempts)
            .field("priority", &self.priority)
            .field("validated", &self.validator.is_some())
            .finish()
    }
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queue: DEFAULT_QUEUE.to_string(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            priority: 0,
            validator: None,
        }
    }

    /// A definition whose payload must deserialize into `T`.
    pub fn typed<T: DeserializeOwned + 'static>(name: impl Into<String>) -> Self {
        Self::new(name).with_validator(|payload| {
            serde_json::from_value::<T>(payload.clone())
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn validate(&self, payload: &Value) -> crate::Result<()> {
        match &self.validator {
            Some(validate) => validate(payload).map_err(|message| crate::Error::Validation {
                field: format!("{} payload", self.name),
                message,
            }),
            None => Ok(()),
        }
    }
}
