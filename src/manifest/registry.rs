//! Manifest lookup by `id:version`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{AgentManifest, ManifestKey};

#[async_trait]
pub trait ManifestRegistry: Send + Sync {
    async fn resolve(&self, key: &ManifestKey) -> crate::Result<Arc<AgentManifest>>;
}

#[derive(Default)]
pub struct InMemoryManifestRegistry {
    manifests: DashMap<ManifestKey, Arc<AgentManifest>>,
}

impl InMemoryManifestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a manifest, replacing any previous one with the same key.
    pub fn register(&self, manifest: AgentManifest) -> ManifestKey {
        let key = manifest.key();
        self.manifests.insert(key.clone(), Arc::new(manifest));
        key
    }

    pub fn contains(&self, key: &ManifestKey) -> bool {
        self.manifests.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.manifests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifests.is_empty()
    }
}

impl FromIterator<AgentManifest> for InMemoryManifestRegistry {
    fn from_iter<I: IntoIterator<Item = AgentManifest>>(iter: I) -> Self {
        let registry = Self::new();
        for manifest in iter {
            registry.register(manifest);
        }
        registry
    }
}

#[async_trait]
impl ManifestRegistry for InMemoryManifestRegistry {
    async fn resolve(&self, key: &ManifestKey) -> crate::Result<Arc<AgentManifest>> {
        self.manifests
            .get(key)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| crate::Error::not_found("manifest", key))
    }
}
