//! Hook manager for registering and dispatching lifecycle hooks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::timeout;

use super::{Hook, HookInput, LifecycleEvent};
use crate::manifest::ManifestKey;

const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(60);

/// Ordered hooks of one manifest, indexed by event.
#[derive(Clone)]
pub struct HookManager {
    hooks: Vec<Arc<dyn Hook>>,
    cache: HashMap<LifecycleEvent, Vec<usize>>,
    default_timeout: Duration,
}

impl Default for HookManager {
    fn default() -> Self {
        Self::new()
    }
}

impl HookManager {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HOOK_TIMEOUT)
    }

    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self {
            hooks: Vec::new(),
            cache: HashMap::new(),
            default_timeout,
        }
    }

    fn rebuild_cache(&mut self) {
        self.cache.clear();
        for event in LifecycleEvent::all() {
            let mut indices: Vec<usize> = self
                .hooks
                .iter()
                .enumerate()
                .filter(|(_, h)| h.events().contains(event))
                .map(|(i, _)| i)
                .collect();
            indices.sort_by_key(|&i| std::cmp::Reverse(self.hooks[i].priority()));
            self.cache.insert(*event, indices);
        }
    }

    pub fn register<H: Hook + 'static>(&mut self, hook: H) {
        self.register_arc(Arc::new(hook));
    }

    pub fn register_arc(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
        self.rebuild_cache();
    }

    pub fn unregister(&mut self, name: &str) {
        self.hooks.retain(|h| h.name() != name);
        self.rebuild_cache();
    }

    pub fn hook_names(&self) -> Vec<&str> {
        self.hooks.iter().map(|h| h.name()).collect()
    }

    #[inline]
    pub fn hooks_for_event(&self, event: LifecycleEvent) -> Vec<&Arc<dyn Hook>> {
        self.cache
            .get(&event)
            .map(|indices| indices.iter().map(|&i| &self.hooks[i]).collect())
            .unwrap_or_default()
    }

    /// Runs every hook for `event` in priority order, stopping at the first failure.
    pub async fn dispatch(&self, event: LifecycleEvent, input: HookInput) -> crate::Result<()> {
        for hook in self.hooks_for_event(event) {
            let limit = hook
                .timeout_secs()
                .map(Duration::from_secs)
                .unwrap_or(self.default_timeout);

            match timeout(limit, hook.execute(input.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(hook = hook.name(), %event, error = %e, "Hook execution failed");
                    return Err(crate::Error::HookFailed {
                        hook: hook.name().to_string(),
                        event: event.to_string(),
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    tracing::warn!(
                        hook = hook.name(),
                        %event,
                        timeout_ms = limit.as_millis() as u64,
                        "Hook timed out"
                    );
                    return Err(crate::Error::HookFailed {
                        hook: hook.name().to_string(),
                        event: event.to_string(),
                        reason: format!("timed out after {:.1}s", limit.as_secs_f64()),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Hook managers keyed by manifest.
pub struct HookRegistry {
    managers: DashMap<ManifestKey, HookManager>,
    default_timeout: Duration,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HOOK_TIMEOUT)
    }

    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self {
            managers: DashMap::new(),
            default_timeout,
        }
    }

    pub fn register<H: Hook + 'static>(&self, manifest: &ManifestKey, hook: H) {
        self.register_arc(manifest, Arc::new(hook));
    }

    pub fn register_arc(&self, manifest: &ManifestKey, hook: Arc<dyn Hook>) {
        self.managers
            .entry(manifest.clone())
            .or_insert_with(|| HookManager::with_timeout(self.default_timeout))
            .register_arc(hook);
    }

    pub fn manager(&self, manifest: &ManifestKey) -> Option<HookManager> {
        self.managers.get(manifest).map(|m| m.value().clone())
    }

    /// A manifest without hooks for `event` is a no-op.
    pub async fn dispatch(
        &self,
        manifest: &ManifestKey,
        event: LifecycleEvent,
        input: HookInput,
    ) -> crate::Result<()> {
        // Clone out of the map so no shard lock is held across awaits.
        let Some(manager) = self.manager(manifest) else {
            tracing::trace!(%manifest, %event, "No hooks registered");
            return Ok(());
        };
        manager.dispatch(event, input).await
    }
}
