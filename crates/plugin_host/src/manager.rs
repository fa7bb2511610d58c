//! Plugin registry

use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

use arca_common::{ArcaError, ArcaResult, Plugin, PluginInfo, PluginRegistry};

use crate::builtin::{InventoryPlugin, SizeLimitPlugin};

/// Registry of plugin prototypes keyed by plugin id.
#[derive(Default)]
pub struct PluginManager {
    prototypes: RwLock<BTreeMap<String, Box<dyn Plugin>>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Manager preloaded with the built-in plugins.
    pub fn with_builtins() -> Self {
        let manager = Self::new();
        manager.register(Box::new(InventoryPlugin::new()));
        manager.register(Box::new(SizeLimitPlugin::new()));
        manager
    }

    /// Register a prototype, replacing any plugin with the same id.
    pub fn register(&self, prototype: Box<dyn Plugin>) {
        let id = prototype.id().to_string();
        debug!("Registering plugin {}", id);
        self.prototypes.write().insert(id, prototype);
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.prototypes.read().contains_key(plugin_id)
    }

    pub fn len(&self) -> usize {
        self.prototypes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.prototypes.read().is_empty()
    }
}

impl PluginRegistry for PluginManager {
    fn resolve(&self, plugin_id: &str) -> ArcaResult<Box<dyn Plugin>> {
        self.prototypes
            .read()
            .get(plugin_id)
            .map(|p| p.clone_plugin())
            .ok_or_else(|| ArcaError::PluginNotFound(plugin_id.to_string()))
    }

    fn list(&self) -> Vec<PluginInfo> {
        self.prototypes.read().values().map(|p| p.info()).collect()
    }
}
