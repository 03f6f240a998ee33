//! Project state comparison.
//!
//! [`StateComparator::compare`] turns two [`ProjectState`] snapshots into the
//! list of [`Change`]s leading from one to the other. Output is
//! deterministic: models are visited in qualified-name order, fields of a
//! surviving model in the target's declaration order, and removals in the
//! source's declaration order.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::state::{FieldState, IndexState, ModelState, ProjectState};

/// One difference between two project states.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum Change {
    /// Model only present in the target.
    CreateModel {
        /// The new model.
        model: ModelState,
    },
    /// Model only present in the source.
    DeleteModel {
        /// The removed model.
        model: ModelState,
    },
    /// Field only present in the target.
    AddField {
        /// Qualified model name.
        model: String,
        /// The new field.
        field: FieldState,
    },
    /// Field only present in the source.
    RemoveField {
        /// Qualified model name.
        model: String,
        /// The removed field.
        field: FieldState,
    },
    /// Field present in both with a different definition.
    AlterField {
        /// Qualified model name.
        model: String,
        /// Definition in the source.
        from: FieldState,
        /// Definition in the target.
        to: FieldState,
        /// Names of the differing attributes (`kind`, `column`, option names).
        changes: Vec<String>,
    },
    /// Field renamed without other changes.
    RenameField {
        /// Qualified model name.
        model: String,
        /// Definition in the source.
        from: FieldState,
        /// Definition in the target.
        to: FieldState,
    },
    /// Index only present in the target.
    AddIndex {
        /// Qualified model name.
        model: String,
        /// The new index.
        index: IndexState,
    },
    /// Index only present in the source.
    RemoveIndex {
        /// Qualified model name.
        model: String,
        /// The removed index.
        index: IndexState,
    },
    /// Unique-together groups changed.
    AlterUniqueTogether {
        /// Qualified model name.
        model: String,
        /// Groups in the source.
        from: Vec<Vec<String>>,
        /// Groups in the target.
        to: Vec<Vec<String>>,
    },
}

impl Change {
    /// Qualified name of the model the change applies to.
    pub fn model_name(&self) -> String {
        match self {
            Change::CreateModel { model } | Change::DeleteModel { model } => model.qualified_name(),
            Change::AddField { model, .. }
            | Change::RemoveField { model, .. }
            | Change::AlterField { model, .. }
            | Change::RenameField { model, .. }
            | Change::AddIndex { model, .. }
            | Change::RemoveIndex { model, .. }
            | Change::AlterUniqueTogether { model, .. } => model.clone(),
        }
    }

    /// Short human-readable description.
    pub fn describe(&self) -> String {
        match self {
            Change::CreateModel { model } => format!("create model {}", model.qualified_name()),
            Change::DeleteModel { model } => format!("delete model {}", model.qualified_name()),
            Change::AddField { model, field } => format!("add field {} to {}", field.name, model),
            Change::RemoveField { model, field } => {
                format!("remove field {} from {}", field.name, model)
            }
            Change::AlterField {
                model, to, changes, ..
            } => format!("alter field {} on {} ({})", to.name, model, changes.join(", ")),
            Change::RenameField { model, from, to } => {
                format!("rename field {} to {} on {}", from.name, to.name, model)
            }
            Change::AddIndex { model, index } => format!("add index {} on {}", index.name, model),
            Change::RemoveIndex { model, index } => {
                format!("remove index {} from {}", index.name, model)
            }
            Change::AlterUniqueTogether { model, .. } => {
                format!("alter unique_together on {model}")
            }
        }
    }
}

/// Diffs project states.
#[derive(Debug, Clone, Copy, Default)]
pub struct StateComparator {
    detect_renames: bool,
}

impl StateComparator {
    /// A comparator reporting renames as a removal plus an addition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pair a removed and an added field with identical kind and options
    /// into a [`Change::RenameField`].
    pub fn with_renames(mut self) -> Self {
        self.detect_renames = true;
        self
    }

    /// Changes turning `from` into `to`.
    pub fn compare(&self, from: &ProjectState, to: &ProjectState) -> Vec<Change> {
        let concrete = |state: &ProjectState, name: &str| {
            state.get(name).filter(|m| !m.is_abstract).cloned()
        };
        let names: BTreeSet<&str> = from.names().chain(to.names()).collect();

        let mut changes = Vec::new();
        for name in names {
            match (concrete(from, name), concrete(to, name)) {
                (None, Some(model)) => changes.push(Change::CreateModel { model }),
                (Some(model), None) => changes.push(Change::DeleteModel { model }),
                (Some(old), Some(new)) => self.compare_model(&old, &new, &mut changes),
                (None, None) => {}
            }
        }
        changes
    }

    fn compare_model(&self, from: &ModelState, to: &ModelState, changes: &mut Vec<Change>) {
        let model = to.qualified_name();

        let mut removed: Vec<&FieldState> = from
            .fields
            .iter()
            .filter(|f| to.field(&f.name).is_none())
            .collect();
        let mut renames: Vec<(&FieldState, &FieldState)> = Vec::new();
        if self.detect_renames {
            for added in to.fields.iter().filter(|f| from.field(&f.name).is_none()) {
                if let Some(pos) = removed.iter().position(|old| same_shape(old, added)) {
                    renames.push((removed.remove(pos), added));
                }
            }
        }

        for field in &to.fields {
            match from.field(&field.name) {
                Some(old) => {
                    let differing = field_differences(old, field);
                    if !differing.is_empty() {
                        changes.push(Change::AlterField {
                            model: model.clone(),
                            from: old.clone(),
                            to: field.clone(),
                            changes: differing,
                        });
                    }
                }
                None => match renames.iter().find(|(_, new)| new.name == field.name) {
                    Some((old, new)) => changes.push(Change::RenameField {
                        model: model.clone(),
                        from: (*old).clone(),
                        to: (*new).clone(),
                    }),
                    None => changes.push(Change::AddField {
                        model: model.clone(),
                        field: field.clone(),
                    }),
                },
            }
        }
        for field in removed {
            changes.push(Change::RemoveField {
                model: model.clone(),
                field: field.clone(),
            });
        }

        for index in &from.indexes {
            let kept = to.indexes.iter().any(|i| i == index);
            if !kept {
                changes.push(Change::RemoveIndex {
                    model: model.clone(),
                    index: index.clone(),
                });
            }
        }
        for index in &to.indexes {
            let existed = from.indexes.iter().any(|i| i == index);
            if !existed {
                changes.push(Change::AddIndex {
                    model: model.clone(),
                    index: index.clone(),
                });
            }
        }

        if from.unique_together != to.unique_together {
            changes.push(Change::AlterUniqueTogether {
                model,
                from: from.unique_together.clone(),
                to: to.unique_together.clone(),
            });
        }
    }
}

/// Whether two fields differ only by name.
fn same_shape(a: &FieldState, b: &FieldState) -> bool {
    let renamed_column = |f: &FieldState| match &f.column {
        None => None,
        Some(column) if *column == f.name || *column == format!("{}_id", f.name) => {
            Some(String::new())
        }
        Some(column) => Some(column.clone()),
    };
    a.kind == b.kind && a.options == b.options && renamed_column(a) == renamed_column(b)
}

/// Attributes that differ between two definitions of one field.
fn field_differences(from: &FieldState, to: &FieldState) -> Vec<String> {
    let mut differing = Vec::new();
    if from.kind != to.kind {
        differing.push("kind".to_string());
    }
    if from.column != to.column {
        differing.push("column".to_string());
    }
    let keys: BTreeSet<&String> = from.options.keys().chain(to.options.keys()).collect();
    for key in keys {
        if from.options.get(key) != to.options.get(key) {
            differing.push(key.clone());
        }
    }
    differing
}
