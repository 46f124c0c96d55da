//! Durable task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::TaskId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Delayed,
    Running,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Delayed => "delayed",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "delayed" => Ok(Self::Delayed),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_name: String,
    pub queue_name: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(
        task_name: impl Into<String>,
        queue_name: impl Into<String>,
        payload: Value,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TaskId::new(),
            task_name: task_name.into(),
            queue_name: queue_name.into(),
            payload,
            status: TaskStatus::Pending,
            priority: 0,
            attempts: 0,
            max_attempts,
            enqueued_at: now,
            delay_until: None,
            user_id: None,
            last_error: None,
            updated_at: now,
        }
    }

    pub fn is_delayed(&self) -> bool {
        self.status == TaskStatus::Delayed
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Partial update merged into an existing record; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_until: Option<Option<DateTime<Utc>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<Option<String>>,
}

impl TaskPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn delay_until(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.delay_until = Some(at);
        self
    }

    pub fn last_error(mut self, error: Option<String>) -> Self {
        self.last_error = Some(error);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn apply(&self, record: &mut TaskRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(priority) = self.priority {
            record.priority = priority;
        }
        if let Some(attempts) = self.attempts {
            record.attempts = attempts;
        }
        if let Some(payload) = &self.payload {
            record.payload = payload.clone();
        }
        if let Some(delay_until) = self.delay_until {
            record.delay_until = delay_until;
        }
        if let Some(last_error) = &self.last_error {
            record.last_error = last_error.clone();
        }
        record.updated_at = Utc::now();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: TaskId,
    pub patch: TaskPatch,
}

impl TaskUpdate {
    pub fn new(id: TaskId, patch: TaskPatch) -> Self {
        Self { id, patch }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_patch_merges_only_set_fields() {
        let mut record = TaskRecord::new("email.send", "email", json!({"to": "a"}), 3);
        record.priority = 5;

        TaskPatch::new()
            .status(TaskStatus::Running)
            .attempts(1)
            .apply(&mut record);

        assert_eq!(record.status, TaskStatus::Running);
        assert_eq!(record.attempts, 1);
        assert_eq!(record.priority, 5);
        assert_eq!(record.payload, json!({"to": "a"}));
    }

    #[test]
    fn test_patch_clears_delay() {
        let mut record = TaskRecord::new("report", "reports", json!({}), 1);
        record.delay_until = Some(Utc::now());
        TaskPatch::new().delay_until(None).apply(&mut record);
        assert!(record.delay_until.is_none());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("delayed".parse::<TaskStatus>().unwrap(), TaskStatus::Delayed);
        assert!("unknown".parse::<TaskStatus>().is_err());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Delayed.is_terminal());
    }
}
