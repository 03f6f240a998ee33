//! Applied-migration bookkeeping.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::MigrationError;
use crate::storage::key::{migration_key, migration_prefix};
use crate::storage::{read_json, write_json, KvBackend};

/// Records which migrations have been applied.
#[async_trait]
pub trait Recorder: Send + Sync {
    /// Mark a migration (qualified name) as applied.
    async fn record(&self, name: &str) -> Result<(), MigrationError>;

    /// Mark a migration as no longer applied.
    async fn unrecord(&self, name: &str) -> Result<(), MigrationError>;

    /// Applied migrations in the order they were recorded.
    async fn applied(&self) -> Result<Vec<String>, MigrationError>;
}

/// In-process recorder.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    applied: Mutex<Vec<String>>,
}

impl MemoryRecorder {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Recorder for MemoryRecorder {
    async fn record(&self, name: &str) -> Result<(), MigrationError> {
        let mut applied = self.applied.lock();
        if !applied.iter().any(|n| n == name) {
            applied.push(name.to_string());
        }
        Ok(())
    }

    async fn unrecord(&self, name: &str) -> Result<(), MigrationError> {
        self.applied.lock().retain(|n| n != name);
        Ok(())
    }

    async fn applied(&self) -> Result<Vec<String>, MigrationError> {
        Ok(self.applied.lock().clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppliedEntry {
    name: String,
    sequence: u64,
    applied_at: DateTime<Utc>,
}

/// Recorder persisting entries in a key-value backend under
/// `_meta/migrations/<app>/<name>`.
#[derive(Debug, Clone)]
pub struct KvRecorder {
    backend: Arc<KvBackend>,
}

impl KvRecorder {
    /// Record into `backend`, which must be connected when used.
    pub fn new(backend: Arc<KvBackend>) -> Self {
        Self { backend }
    }

    fn key(name: &str) -> Vec<u8> {
        match name.split_once('.') {
            Some((app, migration)) => migration_key(app, migration),
            None => migration_key("", name),
        }
    }

    fn entries(&self) -> Result<Vec<AppliedEntry>, MigrationError> {
        let tree = self.backend.tree()?;
        let mut entries = Vec::new();
        for item in tree.scan_prefix(migration_prefix()) {
            let (_, bytes) = item.map_err(crate::error::Error::from)?;
            entries.push(serde_json::from_slice::<AppliedEntry>(&bytes)?);
        }
        entries.sort_by_key(|e| e.sequence);
        Ok(entries)
    }
}

#[async_trait]
impl Recorder for KvRecorder {
    async fn record(&self, name: &str) -> Result<(), MigrationError> {
        let tree = self.backend.tree()?;
        let key = Self::key(name);
        if read_json::<AppliedEntry>(&tree, &key)?.is_some() {
            return Ok(());
        }
        let sequence = self.entries()?.last().map_or(1, |e| e.sequence + 1);
        let entry = AppliedEntry {
            name: name.to_string(),
            sequence,
            applied_at: Utc::now(),
        };
        write_json(&tree, &key, &entry)?;
        debug!(migration = name, sequence, "recorded migration");
        Ok(())
    }

    async fn unrecord(&self, name: &str) -> Result<(), MigrationError> {
        let tree = self.backend.tree()?;
        tree.remove(Self::key(name)).map_err(crate::error::Error::from)?;
        debug!(migration = name, "unrecorded migration");
        Ok(())
    }

    async fn applied(&self) -> Result<Vec<String>, MigrationError> {
        Ok(self.entries()?.into_iter().map(|e| e.name).collect())
    }
}
