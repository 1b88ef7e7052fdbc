//! Engine registry: one independent EngineHandle per agent

use crate::config::EngineConfig;
use crate::engine::EngineHandle;
use dashmap::DashMap;
use reverie_core::AgentKey;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub type SharedEngine = Arc<Mutex<EngineHandle>>;

pub struct EngineRegistry {
    engines: DashMap<AgentKey, SharedEngine>,
    config: EngineConfig,
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl EngineRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self { engines: DashMap::new(), config }
    }

    /// Existing engine for `key`, or a fresh one built from the registry config.
    pub fn get_or_create(&self, key: &AgentKey) -> SharedEngine {
        self.engines
            .entry(key.clone())
            .or_insert_with(|| {
                info!("Creating engine for agent {}", key);
                Arc::new(Mutex::new(EngineHandle::new(self.config.clone())))
            })
            .clone()
    }

    /// Register an engine built elsewhere (e.g. restored from a snapshot).
    pub fn insert(&self, key: AgentKey, engine: EngineHandle) -> SharedEngine {
        let shared = Arc::new(Mutex::new(engine));
        self.engines.insert(key, shared.clone());
        shared
    }

    pub fn get(&self, key: &AgentKey) -> Option<SharedEngine> {
        self.engines.get(key).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<AgentKey> {
        let mut keys: Vec<AgentKey> = self.engines.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn remove(&self, key: &AgentKey) -> Option<SharedEngine> {
        self.engines.remove(key).map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverie_core::{Category, Observation};

    #[tokio::test]
    async fn engines_are_isolated_per_agent() {
        let registry = EngineRegistry::default();
        let a = registry.get_or_create(&AgentKey::new("a"));
        let b = registry.get_or_create(&AgentKey::new("b"));

        a.lock()
            .await
            .admit(Observation::new(Category::Creative, ["forge"], 0.5))
            .unwrap();

        assert_eq!(a.lock().await.window_len(), 1);
        assert_eq!(b.lock().await.window_len(), 0);
        assert!(a.lock().await.balance() < b.lock().await.balance());
    }

    #[tokio::test]
    async fn get_or_create_returns_the_same_engine() {
        let registry = EngineRegistry::default();
        let key = AgentKey::new("agent-1");
        let first = registry.get_or_create(&key);
        let second = registry.get_or_create(&key);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.list(), vec![key.clone()]);

        assert!(registry.remove(&key).is_some());
        assert!(registry.is_empty());
    }
}
