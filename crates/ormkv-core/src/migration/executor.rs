//! Migration executor.
//!
//! Applies unapplied migrations in dependency order through a backend's
//! [`SchemaEditor`](super::SchemaEditor), recording each one as it completes,
//! and unapplies the most recent ones when they carry backward operations.

use std::sync::Arc;

use tracing::{info, instrument};

use super::error::MigrationError;
use super::loader::MigrationLoader;
use super::operation::{Migration, Operation};
use super::recorder::Recorder;
use super::state::ProjectState;
use crate::backend::StorageBackend;

/// Runs migrations against one backend.
pub struct MigrationExecutor {
    backend: Arc<dyn StorageBackend>,
    recorder: Arc<dyn Recorder>,
}

impl MigrationExecutor {
    /// Create an executor.
    pub fn new(backend: Arc<dyn StorageBackend>, recorder: Arc<dyn Recorder>) -> Self {
        Self { backend, recorder }
    }

    /// Migrations not yet applied, in the order they would run.
    pub async fn plan<'l>(&self, loader: &'l MigrationLoader) -> Result<Vec<&'l Migration>, MigrationError> {
        let applied = self.recorder.applied().await?;
        Ok(loader
            .ordered_migrations()?
            .into_iter()
            .filter(|m| !applied.contains(&m.qualified_name()))
            .collect())
    }

    async fn run_operations(
        &self,
        operations: &[Operation],
        mut state: ProjectState,
    ) -> Result<ProjectState, MigrationError> {
        let editor = self.backend.schema_editor()?;
        for operation in operations {
            let next = operation.state_forwards(&state)?;
            operation
                .database_forwards(editor.as_ref(), &state, &next)
                .await?;
            state = next;
        }
        Ok(state)
    }

    /// Apply every unapplied migration. Returns the qualified names applied.
    ///
    /// Migrations already applied are replayed on the project state only, so
    /// later operations see the schema they were written against.
    #[instrument(skip(self, loader), fields(backend = self.backend.name()))]
    pub async fn migrate(&self, loader: &MigrationLoader) -> Result<Vec<String>, MigrationError> {
        let applied = self.recorder.applied().await?;
        let mut state = ProjectState::new();
        let mut done = Vec::new();
        for migration in loader.ordered_migrations()? {
            let name = migration.qualified_name();
            if applied.contains(&name) {
                state = migration.apply_state(&state)?;
                continue;
            }
            state = self.run_operations(&migration.operations, state).await?;
            self.recorder.record(&name).await?;
            info!(migration = %name, operations = migration.operations.len(), "applied migration");
            done.push(name);
        }
        Ok(done)
    }

    /// Unapply the `count` most recently applied migrations, newest first.
    ///
    /// Every targeted migration must be reversible; nothing runs otherwise.
    #[instrument(skip(self, loader), fields(backend = self.backend.name()))]
    pub async fn unapply(&self, loader: &MigrationLoader, count: usize) -> Result<Vec<String>, MigrationError> {
        let applied = self.recorder.applied().await?;

        // State after each applied migration, in dependency order.
        let mut states = Vec::new();
        let mut state = ProjectState::new();
        for migration in loader.ordered_migrations()? {
            if applied.contains(&migration.qualified_name()) {
                state = migration.apply_state(&state)?;
                states.push((migration, state.clone()));
            }
        }

        let targets: Vec<_> = states.into_iter().rev().take(count).collect();
        if let Some((migration, _)) = targets.iter().find(|(m, _)| !m.is_reversible()) {
            return Err(MigrationError::Irreversible(migration.qualified_name()));
        }

        let mut undone = Vec::new();
        for (migration, state) in targets {
            let backward = migration.backward.as_deref().unwrap_or_default();
            self.run_operations(backward, state).await?;
            let name = migration.qualified_name();
            self.recorder.unrecord(&name).await?;
            info!(migration = %name, "unapplied migration");
            undone.push(name);
        }
        Ok(undone)
    }
}

impl std::fmt::Debug for MigrationExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationExecutor")
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::recorder::MemoryRecorder;
    use crate::migration::state::{FieldState, ModelState};
    use crate::storage::{KvBackend, KvConfig};

    fn author() -> ModelState {
        let mut model = ModelState::new("blog", "Author");
        model.fields = vec![
            FieldState::new("id", "AutoField", Some("id".into())).with_option("primary_key", true),
            FieldState::new("name", "CharField", Some("name".into())).with_option("max_length", 100),
        ];
        model
    }

    async fn executor() -> (MigrationExecutor, Arc<dyn StorageBackend>, Arc<MemoryRecorder>) {
        let backend: Arc<dyn StorageBackend> = Arc::new(KvBackend::new("default", KvConfig::temporary()));
        backend.connect().await.unwrap();
        let recorder = Arc::new(MemoryRecorder::new());
        (
            MigrationExecutor::new(backend.clone(), recorder.clone()),
            backend,
            recorder,
        )
    }

    #[tokio::test]
    async fn test_migrate_and_unapply() {
        let (executor, backend, recorder) = executor().await;
        let initial = Migration::new("blog", "0001_initial")
            .with_operation(Operation::CreateModel { model: author() })
            .with_backward(vec![Operation::DeleteModel {
                name: "blog.Author".into(),
            }]);
        let bio = Migration::new("blog", "0002_bio")
            .depends_on("0001_initial")
            .with_operation(Operation::AddField {
                model: "blog.Author".into(),
                field: FieldState::new("bio", "TextField", Some("bio".into())),
            });
        let loader = MigrationLoader::new().with(bio).unwrap().with(initial).unwrap();

        assert_eq!(executor.plan(&loader).await.unwrap().len(), 2);
        let applied = executor.migrate(&loader).await.unwrap();
        assert_eq!(applied, vec!["blog.0001_initial", "blog.0002_bio"]);
        assert!(backend.table_exists("blog_author").await.unwrap());
        let meta = backend.table_meta("blog_author").await.unwrap().unwrap();
        assert!(meta.column("bio").is_some());
        assert!(executor.migrate(&loader).await.unwrap().is_empty());

        assert!(matches!(
            executor.unapply(&loader, 1).await,
            Err(MigrationError::Irreversible(name)) if name == "blog.0002_bio"
        ));
        assert_eq!(recorder.applied().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unapply_reversible_migration() {
        let (executor, backend, recorder) = executor().await;
        let initial = Migration::new("blog", "0001_initial")
            .with_operation(Operation::CreateModel { model: author() })
            .with_backward(vec![Operation::DeleteModel {
                name: "blog.Author".into(),
            }]);
        let loader = MigrationLoader::new().with(initial).unwrap();
        executor.migrate(&loader).await.unwrap();

        let undone = executor.unapply(&loader, 1).await.unwrap();
        assert_eq!(undone, vec!["blog.0001_initial"]);
        assert!(recorder.applied().await.unwrap().is_empty());
        let meta = backend.table_meta("blog_author").await.unwrap().unwrap();
        assert!(meta.deprecated);
    }
}
