//! Backend settings.
//!
//! Settings name a default backend and describe every named backend. They
//! are plain serde data so they can come from a JSON file or the environment:
//!
//! ```json
//! {
//!   "default": "primary",
//!   "backends": {
//!     "primary": { "engine": "key_value", "path": "./data/primary" },
//!     "scratch": { "engine": "key_value", "temporary": true }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::storage::KvConfig;

/// Environment variable read by [`EnvSettings`].
pub const SETTINGS_ENV_VAR: &str = "ORMKV_SETTINGS";

/// Name used when settings do not specify a default backend.
pub const DEFAULT_BACKEND: &str = "default";

fn default_backend_name() -> String {
    DEFAULT_BACKEND.to_string()
}

/// Storage engine of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    /// Ordered key-value store.
    KeyValue,
}

/// Settings for one named backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSettings {
    /// Storage engine.
    pub engine: Engine,
    /// Database directory.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Use a temporary store removed on drop.
    #[serde(default)]
    pub temporary: bool,
    /// Page cache capacity in bytes.
    #[serde(default)]
    pub cache_capacity: Option<u64>,
    /// Flush interval in milliseconds.
    #[serde(default)]
    pub flush_every_ms: Option<u64>,
    /// Enable compression.
    #[serde(default)]
    pub compression: Option<bool>,
    /// Rows deleted per batch when dropping a table.
    #[serde(default)]
    pub drop_batch_size: Option<usize>,
}

impl BackendSettings {
    /// Settings for a temporary key-value store.
    pub fn temporary() -> Self {
        Self {
            engine: Engine::KeyValue,
            path: None,
            temporary: true,
            cache_capacity: None,
            flush_every_ms: None,
            compression: None,
            drop_batch_size: None,
        }
    }

    /// Settings for a key-value store at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            temporary: false,
            ..Self::temporary()
        }
    }

    /// Build the key-value configuration.
    pub fn to_kv_config(&self) -> Result<KvConfig, Error> {
        let mut config = match (&self.path, self.temporary) {
            (_, true) => KvConfig::temporary(),
            (Some(path), false) => KvConfig::new(path),
            (None, false) => {
                return Err(Error::Settings(
                    "a key-value backend needs a path unless it is temporary".into(),
                ))
            }
        };
        if let Some(capacity) = self.cache_capacity {
            config = config.with_cache_capacity(capacity);
        }
        if let Some(ms) = self.flush_every_ms {
            config = config.with_flush_every_ms(Some(ms));
        }
        if let Some(compression) = self.compression {
            config = config.with_compression(compression);
        }
        if let Some(batch) = self.drop_batch_size {
            config = config.with_drop_batch_size(batch);
        }
        Ok(config)
    }
}

/// Default backend name plus named backend settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Name of the default backend.
    #[serde(default = "default_backend_name")]
    pub default: String,
    /// Named backends.
    pub backends: BTreeMap<String, BackendSettings>,
}

impl Settings {
    /// Settings with a single temporary backend named `default`.
    pub fn temporary() -> Self {
        Self::single(DEFAULT_BACKEND, BackendSettings::temporary())
    }

    /// Settings with a single backend that is also the default.
    pub fn single(name: impl Into<String>, backend: BackendSettings) -> Self {
        let name = name.into();
        let mut backends = BTreeMap::new();
        backends.insert(name.clone(), backend);
        Self {
            default: name,
            backends,
        }
    }

    /// Add a named backend.
    pub fn with_backend(mut self, name: impl Into<String>, backend: BackendSettings) -> Self {
        self.backends.insert(name.into(), backend);
        self
    }

    /// Parse settings from JSON.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let settings: Settings =
            serde_json::from_str(json).map_err(|e| Error::Settings(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check that the default backend is defined.
    pub fn validate(&self) -> Result<(), Error> {
        if !self.backends.contains_key(&self.default) {
            return Err(Error::Settings(format!(
                "default backend '{}' is not defined",
                self.default
            )));
        }
        Ok(())
    }
}

/// Source of [`Settings`].
pub trait SettingsProvider: Send + Sync {
    /// Produce settings.
    fn settings(&self) -> Result<Settings, Error>;
}

impl SettingsProvider for Settings {
    fn settings(&self) -> Result<Settings, Error> {
        self.validate()?;
        Ok(self.clone())
    }
}

/// Settings read from a JSON file.
#[derive(Debug, Clone)]
pub struct JsonFileSettings {
    path: PathBuf,
}

impl JsonFileSettings {
    /// Read settings from `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl SettingsProvider for JsonFileSettings {
    fn settings(&self) -> Result<Settings, Error> {
        let json = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::Settings(format!("{}: {}", self.path.display(), e)))?;
        Settings::from_json(&json)
    }
}

/// Settings read from an environment variable holding JSON.
#[derive(Debug, Clone)]
pub struct EnvSettings {
    var: String,
}

impl Default for EnvSettings {
    fn default() -> Self {
        Self {
            var: SETTINGS_ENV_VAR.to_string(),
        }
    }
}

impl EnvSettings {
    /// Read settings from a specific variable.
    pub fn from_var(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl SettingsProvider for EnvSettings {
    fn settings(&self) -> Result<Settings, Error> {
        let json = std::env::var(&self.var)
            .map_err(|e| Error::Settings(format!("{}: {}", self.var, e)))?;
        Settings::from_json(&json)
    }
}
