//! Model registry.
//!
//! The registry maps qualified model names (`app.Model`) to their definitions
//! and keeps a reverse-relation index: for each target model, the relation
//! fields elsewhere that point at it under a `related_name`.
//!
//! Relation targets may name models that are not registered yet. Such targets
//! stay [`RelationTarget::Deferred`] until the target registers, at which point
//! every model pointing at it is rebuilt with a resolved target.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::def::ModelDef;
use crate::error::Error;
use crate::field::{FieldDef, RelationTarget};

/// A relation pointing at a model, seen from the target side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReverseRelation {
    /// Accessor name on the target model.
    pub related_name: String,
    /// Qualified name of the model declaring the relation.
    pub source_model: String,
    /// Relation field on the source model.
    pub source_field: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    models: BTreeMap<String, Arc<ModelDef>>,
    reverse: BTreeMap<String, Vec<ReverseRelation>>,
}

/// Catalog of registered models.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    state: RwLock<RegistryState>,
}

/// Qualify a relation target written relative to `app_label` / `model`.
pub fn qualify_target(app_label: &str, model: &str, raw: &str) -> String {
    if raw == "self" {
        format!("{app_label}.{model}")
    } else if raw.contains('.') {
        raw.to_string()
    } else {
        format!("{app_label}.{raw}")
    }
}

impl ModelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model definition.
    ///
    /// Registering a name that is already present returns the existing
    /// definition unchanged.
    pub fn register(&self, mut def: ModelDef) -> Result<Arc<ModelDef>, Error> {
        let name = def.qualified_name();
        let mut state = self.state.write();

        if let Some(existing) = state.models.get(&name) {
            return Ok(existing.clone());
        }

        let app_label = def.app_label.clone();
        let model_name = def.name.clone();
        for field in def.fields.iter_mut() {
            if let Some(rel) = field.kind.relation_mut() {
                let target = qualify_target(&app_label, &model_name, rel.target.name());
                rel.target = if target == name || state.models.contains_key(&target) {
                    RelationTarget::Resolved(target)
                } else {
                    RelationTarget::Deferred(target)
                };
            }
        }

        if !def.is_abstract {
            for field in &def.fields {
                Self::index_reverse(&mut state, &name, field);
            }
        }

        // Resolve targets deferred on this model.
        let waiting: Vec<String> = state
            .models
            .iter()
            .filter(|(_, m)| {
                m.fields.iter().any(|f| {
                    f.kind
                        .relation()
                        .is_some_and(|r| !r.target.is_resolved() && r.target.name() == name)
                })
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in waiting {
            if let Some(model) = state.models.get(&key) {
                let mut resolved = (**model).clone();
                for field in resolved.fields.iter_mut() {
                    if let Some(rel) = field.kind.relation_mut() {
                        if rel.target.name() == name {
                            rel.target = RelationTarget::Resolved(name.clone());
                        }
                    }
                }
                debug!(model = %key, target = %name, "resolved deferred relation");
                state.models.insert(key, Arc::new(resolved));
            }
        }

        let def = Arc::new(def);
        state.models.insert(name.clone(), def.clone());
        debug!(model = %name, table = %def.table, "registered model");
        Ok(def)
    }

    fn index_reverse(state: &mut RegistryState, source: &str, field: &FieldDef) {
        let Some(rel) = field.kind.relation() else {
            return;
        };
        let Some(related_name) = &rel.related_name else {
            return;
        };
        let entry = ReverseRelation {
            related_name: related_name.clone(),
            source_model: source.to_string(),
            source_field: field.name.clone(),
        };
        let list = state.reverse.entry(rel.target.name().to_string()).or_default();
        if !list.contains(&entry) {
            list.push(entry);
            list.sort();
        }
    }

    /// Look up a model by qualified name, or by bare name when unambiguous.
    pub fn get(&self, name: &str) -> Option<Arc<ModelDef>> {
        let state = self.state.read();
        if let Some(model) = state.models.get(name) {
            return Some(model.clone());
        }
        if name.contains('.') {
            return None;
        }
        let mut matches = state
            .models
            .values()
            .filter(|m| m.name.eq_ignore_ascii_case(name));
        match (matches.next(), matches.next()) {
            (Some(model), None) => Some(model.clone()),
            _ => None,
        }
    }

    /// Look up a model, failing with a registry error when absent.
    pub fn require(&self, name: &str) -> Result<Arc<ModelDef>, Error> {
        self.get(name)
            .ok_or_else(|| Error::Registry(format!("model '{name}' is not registered")))
    }

    /// Whether a model is registered under this qualified name.
    pub fn contains(&self, name: &str) -> bool {
        self.state.read().models.contains_key(name)
    }

    /// Target model of a relation field on `model`.
    pub fn related_model(&self, model: &ModelDef, field: &str) -> Result<Arc<ModelDef>, Error> {
        let def = model
            .field(field)
            .ok_or_else(|| Error::InvalidLookup(format!("{} has no field '{}'", model.name, field)))?;
        let rel = def.kind.relation().ok_or_else(|| {
            Error::InvalidLookup(format!("{}.{} is not a relation", model.name, field))
        })?;
        let target = qualify_target(&model.app_label, &model.name, rel.target.name());
        self.get(&target).ok_or_else(|| {
            Error::Registry(format!(
                "relation {}.{} points at unregistered model '{}'",
                model.name, field, target
            ))
        })
    }

    /// Relations pointing at a model.
    pub fn reverse_relations(&self, target: &str) -> Vec<ReverseRelation> {
        self.state
            .read()
            .reverse
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    /// A reverse relation by accessor name.
    pub fn reverse_relation(&self, target: &str, related_name: &str) -> Option<ReverseRelation> {
        self.reverse_relations(target)
            .into_iter()
            .find(|r| r.related_name == related_name)
    }

    /// Relation fields whose targets are still unregistered, as `(model, field, target)`.
    pub fn unresolved(&self) -> Vec<(String, String, String)> {
        let state = self.state.read();
        let mut out = Vec::new();
        for (name, model) in &state.models {
            for field in &model.fields {
                if let Some(rel) = field.kind.relation() {
                    if !rel.target.is_resolved() {
                        out.push((name.clone(), field.name.clone(), rel.target.name().to_string()));
                    }
                }
            }
        }
        out
    }

    /// All registered models, ordered by qualified name.
    pub fn models(&self) -> Vec<Arc<ModelDef>> {
        self.state.read().models.values().cloned().collect()
    }

    /// Number of registered models.
    pub fn len(&self) -> usize {
        self.state.read().models.len()
    }

    /// Whether no models are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every model and reverse relation.
    pub fn reset(&self) {
        let mut state = self.state.write();
        state.models.clear();
        state.reverse.clear();
    }
}
