//! Tunables of the agent runtime.

use std::time::Duration;

use serde::de::DeserializeOwned;

use super::{ConfigError, ConfigProvider, ConfigProviderExt, ConfigResult};
use crate::agent::DEFAULT_MAX_STEPS;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Lifetime of persisted agent state.
    pub agent_state_ttl: Duration,
    /// Wall-clock ceiling of one run unless the manifest overrides it.
    pub agent_timeout: Duration,
    /// Lifetime of the lock held while a state is being resumed.
    pub agent_run_lock_ttl: Duration,
    pub cancellation_signal_ttl: Duration,
    /// Minimum gap between two cancellation reads of a run. Zero reads at every step.
    pub cancellation_poll_interval: Duration,
    pub emit_stream_events: bool,
    pub default_max_steps: u32,
    pub hook_timeout: Duration,
    pub max_output_validation_retries: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            agent_state_ttl: Duration::from_secs(86_400),
            agent_timeout: Duration::from_millis(300_000),
            agent_run_lock_ttl: Duration::from_secs(30),
            cancellation_signal_ttl: Duration::from_secs(3_600),
            cancellation_poll_interval: Duration::from_millis(1_000),
            emit_stream_events: true,
            default_max_steps: DEFAULT_MAX_STEPS,
            hook_timeout: Duration::from_secs(60),
            max_output_validation_retries: 2,
        }
    }
}

impl RuntimeConfig {
    /// Reads every known key from `provider`, keeping defaults for absent ones.
    ///
    /// TTLs and `hooks.timeout` are seconds; `agent.timeout` and
    /// `cancellation.poll_interval_ms` are milliseconds.
    pub async fn load(provider: &dyn ConfigProvider) -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(secs) = read::<u64>(provider, "agent.state_ttl").await? {
            config.agent_state_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = read::<u64>(provider, "agent.timeout").await? {
            config.agent_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = read::<u64>(provider, "agent.run_lock_ttl").await? {
            config.agent_run_lock_ttl = Duration::from_secs(secs);
        }
        if let Some(steps) = read::<u32>(provider, "agent.default_max_steps").await? {
            config.default_max_steps = steps;
        }
        if let Some(retries) = read::<u32>(provider, "agent.output_validation_retries").await? {
            config.max_output_validation_retries = retries;
        }
        if let Some(secs) = read::<u64>(provider, "cancellation.signal_ttl").await? {
            config.cancellation_signal_ttl = Duration::from_secs(secs);
        }
        if let Some(ms) = read::<u64>(provider, "cancellation.poll_interval_ms").await? {
            config.cancellation_poll_interval = Duration::from_millis(ms);
        }
        if let Some(emit) = read::<bool>(provider, "stream.emit_events").await? {
            config.emit_stream_events = emit;
        }
        if let Some(secs) = read::<u64>(provider, "hooks.timeout").await? {
            config.hook_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        tracing::debug!(?config, "Runtime configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let non_zero = [
            ("agent.state_ttl", self.agent_state_ttl),
            ("agent.timeout", self.agent_timeout),
            ("agent.run_lock_ttl", self.agent_run_lock_ttl),
            ("cancellation.signal_ttl", self.cancellation_signal_ttl),
            ("hooks.timeout", self.hook_timeout),
        ];
        for (key, value) in non_zero {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.default_max_steps == 0 {
            return Err(ConfigError::InvalidValue {
                key: "agent.default_max_steps".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.cancellation_poll_interval = interval;
        self
    }

    pub fn with_stream_events(mut self, emit: bool) -> Self {
        self.emit_stream_events = emit;
        self
    }

    pub fn with_hook_timeout(mut self, timeout: Duration) -> Self {
        self.hook_timeout = timeout;
        self
    }

    pub fn with_max_output_validation_retries(mut self, retries: u32) -> Self {
        self.max_output_validation_retries = retries;
        self
    }
}

async fn read<T: DeserializeOwned + Send>(
    provider: &dyn ConfigProvider,
    key: &str,
) -> ConfigResult<Option<T>> {
    provider.get::<T>(key).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfigProvider;

    #[tokio::test]
    async fn test_load_defaults() {
        let config = RuntimeConfig::load(&MemoryConfigProvider::new()).await.unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.agent_timeout, Duration::from_secs(300));
        assert_eq!(config.default_max_steps, 20);
    }

    #[tokio::test]
    async fn test_load_overrides() {
        let provider = MemoryConfigProvider::new()
            .value("agent.timeout", 1_500)
            .value("cancellation.poll_interval_ms", 0)
            .value("stream.emit_events", false)
            .value("hooks.timeout", 2);

        let config = RuntimeConfig::load(&provider).await.unwrap();
        assert_eq!(config.agent_timeout, Duration::from_millis(1_500));
        assert_eq!(config.cancellation_poll_interval, Duration::ZERO);
        assert!(!config.emit_stream_events);
        assert_eq!(config.hook_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_rejects_invalid_values() {
        let provider = MemoryConfigProvider::new().value("agent.state_ttl", 0);
        let err = RuntimeConfig::load(&provider).await.unwrap_err();
        assert!(err.to_string().contains("agent.state_ttl"));

        let provider = MemoryConfigProvider::new().value("agent.timeout", "soon");
        assert!(matches!(
            RuntimeConfig::load(&provider).await,
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
