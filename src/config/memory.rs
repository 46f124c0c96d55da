//! In-memory configuration provider, mostly for tests and code-defined settings.

use std::collections::HashMap;

use super::ConfigResult;
use super::provider::ConfigProvider;

#[derive(Debug, Clone)]
pub struct MemoryConfigProvider {
    data: HashMap<String, String>,
    name: String,
}

impl Default for MemoryConfigProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfigProvider {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            data: HashMap::new(),
            name: name.into(),
        }
    }

    pub fn from_data(data: HashMap<String, String>) -> Self {
        Self {
            data,
            name: "memory".to_string(),
        }
    }

    pub fn value(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.data.insert(key.into(), value.to_string());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[async_trait::async_trait]
impl ConfigProvider for MemoryConfigProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_raw(&self, key: &str) -> ConfigResult<Option<String>> {
        Ok(self.data.get(key).cloned())
    }

    async fn list_keys(&self, prefix: &str) -> ConfigResult<Vec<String>> {
        Ok(self
            .data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigProviderExt;

    #[tokio::test]
    async fn test_typed_values() {
        let provider = MemoryConfigProvider::new()
            .value("agent.timeout", 1500)
            .value("stream.emit_events", false)
            .value("queue.name", "default");

        let timeout: Option<u64> = provider.get("agent.timeout").await.unwrap();
        assert_eq!(timeout, Some(1500));
        let emit: Option<bool> = provider.get("stream.emit_events").await.unwrap();
        assert_eq!(emit, Some(false));
        let name: Option<String> = provider.get("queue.name").await.unwrap();
        assert_eq!(name.as_deref(), Some("default"));

        let bad: crate::config::ConfigResult<Option<u64>> = provider.get("queue.name").await;
        assert!(bad.is_err());
    }

    #[tokio::test]
    async fn test_list_keys() {
        let provider = MemoryConfigProvider::new()
            .value("agent.timeout", 1)
            .value("agent.state_ttl", 2)
            .value("hooks.timeout", 3);
        let mut keys = provider.list_keys("agent.").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["agent.state_ttl", "agent.timeout"]);
    }
}
