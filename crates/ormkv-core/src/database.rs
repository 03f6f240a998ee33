//! Registry plus connections.

use std::sync::Arc;

use crate::backend::{Connections, SettingsProvider, StorageBackend};
use crate::error::Error;
use crate::migration::ProjectState;
use crate::model::{ModelDef, ModelRegistry};
use crate::query::Manager;
use crate::storage::{KvBackend, KvConfig};

/// Handle shared by managers, querysets and instances.
///
/// Cloning is cheap; clones share the registry and the connections.
#[derive(Clone, Debug)]
pub struct Database {
    registry: Arc<ModelRegistry>,
    connections: Arc<Connections>,
}

impl Database {
    /// Combine a registry and a set of connections.
    pub fn new(registry: Arc<ModelRegistry>, connections: Arc<Connections>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Connect every backend described by `provider`, with an empty registry.
    pub async fn from_settings(provider: &dyn SettingsProvider) -> Result<Self, Error> {
        let connections = Connections::from_settings(provider).await?;
        Ok(Self::new(Arc::default(), Arc::new(connections)))
    }

    /// A database with one connected, temporary key-value backend named
    /// `default`.
    pub async fn temporary() -> Result<Self, Error> {
        let backend = KvBackend::new("default", KvConfig::temporary());
        backend.connect().await?;
        let connections = Connections::new("default").with_backend(Arc::new(backend));
        Ok(Self::new(Arc::default(), Arc::new(connections)))
    }

    /// The model registry.
    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// The configured backends.
    pub fn connections(&self) -> &Arc<Connections> {
        &self.connections
    }

    /// A backend by name, or the default one.
    pub fn backend(&self, name: Option<&str>) -> Result<Arc<dyn StorageBackend>, Error> {
        self.connections.backend(name)
    }

    /// Register a model and return its manager.
    pub fn register(&self, def: ModelDef) -> Result<Manager, Error> {
        Manager::new(self, def)
    }

    /// Manager of an already registered model.
    pub fn manager(&self, name: &str) -> Result<Manager, Error> {
        let model = self.registry.require(name)?;
        model.ensure_concrete()?;
        Ok(Manager::for_model(self.clone(), model))
    }

    /// Migration snapshot of every registered model.
    pub fn project_state(&self) -> ProjectState {
        ProjectState::from_registry(&self.registry)
    }
}
