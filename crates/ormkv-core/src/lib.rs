//! ormkv core - models, querysets, storage backends and migrations.
//!
//! This crate provides the object-persistence engine for ormkv: typed field
//! and model metadata, lazily evaluated querysets with relation-spanning
//! filters, a sled-backed key-value [`StorageBackend`], and a migration
//! engine that diffs schema snapshots and orders migrations by dependency.
//!
//! ```ignore
//! let db = Database::temporary().await?;
//! let authors = db.register(
//!     ModelDef::builder("blog", "Author")
//!         .field("name", FieldDef::char(100))
//!         .build()?,
//! )?;
//! authors.create(&[("name", "Alice".into())]).await?;
//! let found = authors.filter("name__iexact", "alice").fetch().await?;
//! assert_eq!(found.array().len(), 1);
//! ```

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod backend;
pub mod database;
pub mod error;
pub mod field;
pub mod migration;
pub mod model;
pub mod query;
pub mod storage;

pub use backend::{
    BackendSettings, BackendTransaction, Connections, Engine, EnvSettings, JsonFileSettings,
    Settings, SettingsProvider, StorageBackend, TableMeta,
};
pub use database::Database;
pub use error::{Error, ValidationErrors};
pub use field::{DefaultValue, FieldDef, FieldKind, FieldValue, OnDelete};
pub use migration::{
    Change, Migration, MigrationError, MigrationExecutor, MigrationLoader, MigrationNamer,
    ModelState, Operation, ProjectState, StateComparator,
};
pub use model::{Instance, ModelDef, ModelRegistry, SaveOutcome};
pub use query::{LookupValue, Manager, QuerySet, SaveSummary};
pub use storage::{KvBackend, KvConfig};

/// Re-export storage value and query types.
pub use ormkv_proto as proto;
