//! Migration operations and migrations.
//!
//! An [`Operation`] does two things: it transforms a [`ProjectState`]
//! (`state_forwards`) and drives a [`SchemaEditor`] (`database_forwards`).
//! Removals deprecate instead of destroying data.

use serde::{Deserialize, Serialize};

use super::diff::Change;
use super::error::MigrationError;
use super::schema_editor::SchemaEditor;
use super::state::{FieldState, IndexState, ModelState, ProjectState};

/// A single schema operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Create a model.
    CreateModel {
        /// The model.
        model: ModelState,
    },
    /// Delete a model.
    DeleteModel {
        /// Qualified model name.
        name: String,
    },
    /// Add a field.
    AddField {
        /// Qualified model name.
        model: String,
        /// The field.
        field: FieldState,
    },
    /// Remove a field.
    RemoveField {
        /// Qualified model name.
        model: String,
        /// Field name.
        name: String,
    },
    /// Replace a field's definition.
    AlterField {
        /// Qualified model name.
        model: String,
        /// The new definition.
        field: FieldState,
    },
    /// Rename a field.
    RenameField {
        /// Qualified model name.
        model: String,
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Add an index.
    AddIndex {
        /// Qualified model name.
        model: String,
        /// The index.
        index: IndexState,
    },
    /// Remove an index.
    RemoveIndex {
        /// Qualified model name.
        model: String,
        /// Index name.
        name: String,
    },
    /// Replace unique-together groups.
    AlterUniqueTogether {
        /// Qualified model name.
        model: String,
        /// The new groups.
        groups: Vec<Vec<String>>,
    },
}

fn model_of<'s>(state: &'s ProjectState, name: &str) -> Result<&'s ModelState, MigrationError> {
    state
        .get(name)
        .ok_or_else(|| MigrationError::UnknownModel(name.to_string()))
}

fn field_of<'m>(model: &'m ModelState, name: &str) -> Result<&'m FieldState, MigrationError> {
    model.field(name).ok_or_else(|| MigrationError::UnknownField {
        model: model.qualified_name(),
        field: name.to_string(),
    })
}

impl Operation {
    /// Qualified name of the model the operation touches.
    pub fn model_name(&self) -> String {
        match self {
            Operation::CreateModel { model } => model.qualified_name(),
            Operation::DeleteModel { name } => name.clone(),
            Operation::AddField { model, .. }
            | Operation::RemoveField { model, .. }
            | Operation::AlterField { model, .. }
            | Operation::RenameField { model, .. }
            | Operation::AddIndex { model, .. }
            | Operation::RemoveIndex { model, .. }
            | Operation::AlterUniqueTogether { model, .. } => model.clone(),
        }
    }

    /// Short human-readable description.
    pub fn describe(&self) -> String {
        match self {
            Operation::CreateModel { model } => format!("Create model {}", model.qualified_name()),
            Operation::DeleteModel { name } => format!("Delete model {name}"),
            Operation::AddField { model, field } => format!("Add field {} to {}", field.name, model),
            Operation::RemoveField { model, name } => format!("Remove field {name} from {model}"),
            Operation::AlterField { model, field } => format!("Alter field {} on {}", field.name, model),
            Operation::RenameField { model, from, to } => {
                format!("Rename field {from} on {model} to {to}")
            }
            Operation::AddIndex { model, index } => format!("Add index {} on {}", index.name, model),
            Operation::RemoveIndex { model, name } => format!("Remove index {name} from {model}"),
            Operation::AlterUniqueTogether { model, .. } => {
                format!("Alter unique_together on {model}")
            }
        }
    }

    /// Apply the operation to a project state.
    pub fn state_forwards(&self, state: &ProjectState) -> Result<ProjectState, MigrationError> {
        Ok(match self {
            Operation::CreateModel { model } => state.with_model(model.clone()),
            Operation::DeleteModel { name } => {
                model_of(state, name)?;
                state.without_model(name)
            }
            Operation::AddField { model, field } => {
                state.with_model(model_of(state, model)?.with_field(field.clone()))
            }
            Operation::RemoveField { model, name } => {
                let current = model_of(state, model)?;
                field_of(current, name)?;
                state.with_model(current.without_field(name))
            }
            Operation::AlterField { model, field } => {
                let current = model_of(state, model)?;
                field_of(current, &field.name)?;
                state.with_model(current.with_field(field.clone()))
            }
            Operation::RenameField { model, from, to } => {
                let current = model_of(state, model)?;
                field_of(current, from)?;
                state.with_model(current.with_renamed_field(from, to))
            }
            Operation::AddIndex { model, index } => {
                state.with_model(model_of(state, model)?.with_index(index.clone()))
            }
            Operation::RemoveIndex { model, name } => {
                state.with_model(model_of(state, model)?.without_index(name))
            }
            Operation::AlterUniqueTogether { model, groups } => {
                state.with_model(model_of(state, model)?.with_unique_together(groups.clone()))
            }
        })
    }

    /// Apply the operation to storage. `from` is the state before the
    /// operation and `to` the state after it.
    pub async fn database_forwards(
        &self,
        editor: &dyn SchemaEditor,
        from: &ProjectState,
        to: &ProjectState,
    ) -> Result<(), MigrationError> {
        match self {
            Operation::CreateModel { model } => editor.create_model(model).await?,
            Operation::DeleteModel { name } => editor.deprecate_model(model_of(from, name)?).await?,
            Operation::AddField { model, field } => {
                editor.add_field(model_of(to, model)?, field).await?
            }
            Operation::RemoveField { model, name } => {
                let current = model_of(from, model)?;
                editor.deprecate_field(current, field_of(current, name)?).await?
            }
            Operation::AlterField { model, field } => {
                let old = field_of(model_of(from, model)?, &field.name)?;
                editor.alter_field(model_of(to, model)?, old, field).await?
            }
            Operation::RenameField {
                model,
                from: old_name,
                to: new_name,
            } => {
                let old = field_of(model_of(from, model)?, old_name)?;
                let target = model_of(to, model)?;
                editor.rename_field(target, old, field_of(target, new_name)?).await?
            }
            Operation::AddIndex { model, index } => editor.add_index(model_of(to, model)?, index).await?,
            Operation::RemoveIndex { model, name } => {
                let current = model_of(from, model)?;
                let index = current
                    .indexes
                    .iter()
                    .find(|i| &i.name == name)
                    .cloned()
                    .unwrap_or_else(|| IndexState {
                        name: name.clone(),
                        fields: Vec::new(),
                        unique: false,
                    });
                editor.remove_index(current, &index).await?
            }
            Operation::AlterUniqueTogether { model, groups } => {
                editor.alter_unique_together(model_of(to, model)?, groups).await?
            }
        }
        Ok(())
    }

    /// The operation carrying out a change.
    pub fn from_change(change: &Change) -> Self {
        match change {
            Change::CreateModel { model } => Operation::CreateModel {
                model: model.clone(),
            },
            Change::DeleteModel { model } => Operation::DeleteModel {
                name: model.qualified_name(),
            },
            Change::AddField { model, field } => Operation::AddField {
                model: model.clone(),
                field: field.clone(),
            },
            Change::RemoveField { model, field } => Operation::RemoveField {
                model: model.clone(),
                name: field.name.clone(),
            },
            Change::AlterField { model, to, .. } => Operation::AlterField {
                model: model.clone(),
                field: to.clone(),
            },
            Change::RenameField { model, from, to } => Operation::RenameField {
                model: model.clone(),
                from: from.name.clone(),
                to: to.name.clone(),
            },
            Change::AddIndex { model, index } => Operation::AddIndex {
                model: model.clone(),
                index: index.clone(),
            },
            Change::RemoveIndex { model, index } => Operation::RemoveIndex {
                model: model.clone(),
                name: index.name.clone(),
            },
            Change::AlterUniqueTogether { model, to, .. } => Operation::AlterUniqueTogether {
                model: model.clone(),
                groups: to.clone(),
            },
        }
    }

    /// The operation undoing a change.
    pub fn reverse_of(change: &Change) -> Self {
        match change {
            Change::CreateModel { model } => Operation::DeleteModel {
                name: model.qualified_name(),
            },
            Change::DeleteModel { model } => Operation::CreateModel {
                model: model.clone(),
            },
            Change::AddField { model, field } => Operation::RemoveField {
                model: model.clone(),
                name: field.name.clone(),
            },
            Change::RemoveField { model, field } => Operation::AddField {
                model: model.clone(),
                field: field.clone(),
            },
            Change::AlterField { model, from, .. } => Operation::AlterField {
                model: model.clone(),
                field: from.clone(),
            },
            Change::RenameField { model, from, to } => Operation::RenameField {
                model: model.clone(),
                from: to.name.clone(),
                to: from.name.clone(),
            },
            Change::AddIndex { model, index } => Operation::RemoveIndex {
                model: model.clone(),
                name: index.name.clone(),
            },
            Change::RemoveIndex { model, index } => Operation::AddIndex {
                model: model.clone(),
                index: index.clone(),
            },
            Change::AlterUniqueTogether { model, from, .. } => Operation::AlterUniqueTogether {
                model: model.clone(),
                groups: from.clone(),
            },
        }
    }
}

/// A named, ordered group of operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    /// Application label.
    pub app_label: String,
    /// Migration name, unique within the app (`0001_initial`).
    pub name: String,
    /// Dependencies as `name` (same app) or `app.name`.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Forward operations.
    pub operations: Vec<Operation>,
    /// Backward operations; `None` makes the migration irreversible.
    #[serde(default)]
    pub backward: Option<Vec<Operation>>,
}

impl Migration {
    /// An empty, irreversible migration.
    pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_label: app_label.into(),
            name: name.into(),
            dependencies: Vec::new(),
            operations: Vec::new(),
            backward: None,
        }
    }

    /// Build a reversible migration from a change list.
    pub fn from_changes(app_label: impl Into<String>, name: impl Into<String>, changes: &[Change]) -> Self {
        let mut migration = Self::new(app_label, name);
        migration.operations = changes.iter().map(Operation::from_change).collect();
        migration.backward = Some(changes.iter().rev().map(Operation::reverse_of).collect());
        migration
    }

    /// Add a dependency.
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        self.dependencies.push(dependency.into());
        self
    }

    /// Add a forward operation.
    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    /// Set the backward operations.
    pub fn with_backward(mut self, operations: Vec<Operation>) -> Self {
        self.backward = Some(operations);
        self
    }

    /// `app.name`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.app_label, self.name)
    }

    /// Whether backward operations exist.
    pub fn is_reversible(&self) -> bool {
        self.backward.is_some()
    }

    /// Dependencies qualified with an app label; bare names belong to this
    /// migration's app.
    pub fn resolved_dependencies(&self) -> Vec<String> {
        self.dependencies
            .iter()
            .map(|dep| {
                if dep.contains('.') {
                    dep.clone()
                } else {
                    format!("{}.{}", self.app_label, dep)
                }
            })
            .collect()
    }

    /// Replay the forward operations onto a state.
    pub fn apply_state(&self, state: &ProjectState) -> Result<ProjectState, MigrationError> {
        self.operations
            .iter()
            .try_fold(state.clone(), |state, op| op.state_forwards(&state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::diff::StateComparator;

    fn author() -> ModelState {
        let mut model = ModelState::new("blog", "Author");
        model.fields = vec![
            FieldState::new("id", "AutoField", Some("id".into())).with_option("primary_key", true),
            FieldState::new("name", "CharField", Some("name".into())).with_option("max_length", 100),
        ];
        model
    }

    #[test]
    fn test_state_forwards_is_pure() {
        let empty = ProjectState::new();
        let created = Operation::CreateModel { model: author() }.state_forwards(&empty).unwrap();
        assert!(empty.is_empty());
        assert!(created.contains("blog.Author"));

        let renamed = Operation::RenameField {
            model: "blog.Author".into(),
            from: "name".into(),
            to: "title".into(),
        }
        .state_forwards(&created)
        .unwrap();
        assert!(renamed.get("blog.Author").unwrap().field("title").is_some());
        assert!(created.get("blog.Author").unwrap().field("name").is_some());
    }

    #[test]
    fn test_unknown_targets() {
        let empty = ProjectState::new();
        let err = Operation::RemoveField {
            model: "blog.Author".into(),
            name: "name".into(),
        }
        .state_forwards(&empty)
        .unwrap_err();
        assert!(matches!(err, MigrationError::UnknownModel(_)));

        let created = Operation::CreateModel { model: author() }.state_forwards(&empty).unwrap();
        let err = Operation::RemoveField {
            model: "blog.Author".into(),
            name: "email".into(),
        }
        .state_forwards(&created)
        .unwrap_err();
        assert!(matches!(err, MigrationError::UnknownField { .. }));
    }

    #[test]
    fn test_from_changes_round_trips_state() {
        let before = ProjectState::from_models([author()]);
        let mut changed = author();
        changed.fields[1] = changed.fields[1].clone().with_option("max_length", 200);
        changed = changed.with_field(FieldState::new("bio", "TextField", Some("bio".into())));
        let after = ProjectState::from_models([changed]);

        let changes = StateComparator::new().compare(&before, &after);
        let migration = Migration::from_changes("blog", "0002_author_bio", &changes);
        assert!(migration.is_reversible());
        assert_eq!(migration.apply_state(&before).unwrap(), after);

        let backward = migration.backward.clone().unwrap();
        let undone = backward
            .iter()
            .try_fold(after.clone(), |state, op| op.state_forwards(&state))
            .unwrap();
        assert_eq!(undone, before);
    }

    #[test]
    fn test_dependencies_and_serialization() {
        let migration = Migration::new("blog", "0002_posts")
            .depends_on("0001_initial")
            .depends_on("auth.0003_users")
            .with_operation(Operation::CreateModel { model: author() });
        assert_eq!(
            migration.resolved_dependencies(),
            vec!["blog.0001_initial", "auth.0003_users"]
        );
        assert!(!migration.is_reversible());

        let json = serde_json::to_string(&migration).unwrap();
        assert!(json.contains("\"op\":\"create_model\""));
        let back: Migration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, migration);
    }
}
