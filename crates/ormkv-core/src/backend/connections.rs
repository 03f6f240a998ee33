//! Named backend connections.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use super::settings::{Engine, SettingsProvider};
use super::StorageBackend;
use crate::error::Error;
use crate::storage::KvBackend;

/// Backends by name, plus the name of the default one.
pub struct Connections {
    default: String,
    backends: DashMap<String, Arc<dyn StorageBackend>>,
}

impl Connections {
    /// Create an empty set with the given default name.
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            backends: DashMap::new(),
        }
    }

    /// Build and connect every backend described by the settings.
    pub async fn from_settings(provider: &dyn SettingsProvider) -> Result<Self, Error> {
        let settings = provider.settings()?;
        let connections = Self::new(settings.default.clone());
        for (name, backend) in &settings.backends {
            match backend.engine {
                Engine::KeyValue => {
                    let kv = KvBackend::new(name.clone(), backend.to_kv_config()?);
                    kv.connect().await?;
                    connections.add(Arc::new(kv));
                }
            }
        }
        info!(
            default = %connections.default,
            backends = connections.backends.len(),
            "connections ready"
        );
        Ok(connections)
    }

    /// Register a backend under its own name, replacing any previous one.
    pub fn add(&self, backend: Arc<dyn StorageBackend>) {
        self.backends.insert(backend.name().to_string(), backend);
    }

    /// Builder form of [`Connections::add`].
    pub fn with_backend(self, backend: Arc<dyn StorageBackend>) -> Self {
        self.add(backend);
        self
    }

    /// Name of the default backend.
    pub fn default_name(&self) -> &str {
        &self.default
    }

    /// Look up a backend by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn StorageBackend>, Error> {
        self.backends
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::Settings(format!("backend '{name}' is not configured")))
    }

    /// The named backend, or the default one.
    pub fn backend(&self, name: Option<&str>) -> Result<Arc<dyn StorageBackend>, Error> {
        self.get(name.unwrap_or(&self.default))
    }

    /// Names of every configured backend, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Disconnect every backend.
    pub async fn disconnect_all(&self) -> Result<(), Error> {
        let backends: Vec<Arc<dyn StorageBackend>> =
            self.backends.iter().map(|e| e.value().clone()).collect();
        for backend in backends {
            if backend.is_connected() {
                backend.disconnect().await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Connections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connections")
            .field("default", &self.default)
            .field("backends", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendSettings, Settings};

    #[tokio::test]
    async fn test_from_settings_connects_backends() {
        let settings = Settings::temporary().with_backend("replica", BackendSettings::temporary());
        let connections = Connections::from_settings(&settings).await.unwrap();

        assert_eq!(connections.names(), vec!["default", "replica"]);
        assert!(connections.backend(None).unwrap().is_connected());
        assert_eq!(connections.backend(Some("replica")).unwrap().name(), "replica");
        assert!(matches!(connections.get("missing"), Err(Error::Settings(_))));

        connections.disconnect_all().await.unwrap();
        assert!(!connections.backend(None).unwrap().is_connected());
    }
}
