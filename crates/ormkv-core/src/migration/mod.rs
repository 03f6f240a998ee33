//! Schema migrations.
//!
//! | Piece | Role |
//! |-------|------|
//! | [`ModelState`] / [`ProjectState`] | Immutable schema snapshots |
//! | [`StateComparator`] | Diffs two snapshots into [`Change`]s |
//! | [`Operation`] / [`Migration`] | Serialisable schema steps, forward and backward |
//! | [`MigrationLoader`] | Dependency graph and deterministic ordering |
//! | [`MigrationNamer`] | Advisory names for change lists |
//! | [`MigrationExecutor`] | Applies and unapplies migrations through a [`SchemaEditor`] |
//! | [`Recorder`] | Tracks applied migrations |
//!
//! # Example
//!
//! ```ignore
//! let changes = StateComparator::new().compare(&loader.project_state()?, &db.project_state());
//! let name = MigrationNamer::new().suggest(&changes).file_name(2);
//! loader.register(Migration::from_changes("blog", name, &changes).depends_on("0001_init_initial"))?;
//! MigrationExecutor::new(backend, recorder).migrate(&loader).await?;
//! ```

pub mod diff;
pub mod error;
pub mod executor;
pub mod loader;
pub mod namer;
pub mod operation;
pub mod recorder;
pub mod schema_editor;
pub mod state;

pub use diff::{Change, StateComparator};
pub use error::MigrationError;
pub use executor::MigrationExecutor;
pub use loader::MigrationLoader;
pub use namer::{MigrationKind, MigrationName, MigrationNamer};
pub use operation::{Migration, Operation};
pub use recorder::{KvRecorder, MemoryRecorder, Recorder};
pub use schema_editor::SchemaEditor;
pub use state::{FieldState, IndexState, ModelState, ProjectState};
