//! Per-model entry point.

use std::sync::Arc;

use tracing::debug;

use super::lookup::LookupValue;
use super::queryset::QuerySet;
use crate::database::Database;
use crate::error::Error;
use crate::field::FieldValue;
use crate::model::{Instance, ModelDef};

/// Builds querysets and instances for one registered model.
#[derive(Clone)]
pub struct Manager {
    db: Database,
    model: Arc<ModelDef>,
}

impl Manager {
    /// Register `def` with the database and return its manager.
    pub fn new(db: &Database, def: ModelDef) -> Result<Self, Error> {
        let model = db.registry().register(def)?;
        model.ensure_concrete()?;
        Ok(Self {
            db: db.clone(),
            model,
        })
    }

    pub(crate) fn for_model(db: Database, model: Arc<ModelDef>) -> Self {
        Self { db, model }
    }

    /// The managed model.
    pub fn model(&self) -> &Arc<ModelDef> {
        &self.model
    }

    /// Every row.
    pub fn all(&self) -> QuerySet {
        QuerySet::new(self.db.clone(), self.model.clone())
    }

    /// Rows matching `path`.
    pub fn filter(&self, path: &str, value: impl Into<LookupValue>) -> QuerySet {
        self.all().filter(path, value)
    }

    /// Rows not matching `path`.
    pub fn exclude(&self, path: &str, value: impl Into<LookupValue>) -> QuerySet {
        self.all().exclude(path, value)
    }

    /// Every row, ordered.
    pub fn order_by(&self, fields: &[&str]) -> QuerySet {
        self.all().order_by(fields)
    }

    /// The single row matching `path`.
    pub async fn get(&self, path: &str, value: impl Into<LookupValue>) -> Result<Instance, Error> {
        self.filter(path, value).get().await
    }

    /// Number of rows.
    pub async fn count(&self) -> Result<usize, Error> {
        self.all().count().await
    }

    /// A new unsaved instance with default values.
    pub fn new_instance(&self) -> Instance {
        Instance::new(self.model.clone())
    }

    /// Build an instance from `(field, value)` pairs and save it.
    pub async fn create(&self, values: &[(&str, FieldValue)]) -> Result<Instance, Error> {
        let mut instance = self.new_instance();
        for (name, value) in values {
            instance.set(name, value.clone())?;
        }
        instance.save(&self.db).await?;
        Ok(instance)
    }

    /// Insert unsaved instances in one atomic batch, assigning their keys.
    ///
    /// Every instance is validated before anything is written.
    pub async fn bulk_create(&self, mut instances: Vec<Instance>) -> Result<Vec<Instance>, Error> {
        self.model.ensure_concrete()?;
        if instances.is_empty() {
            return Ok(instances);
        }
        let table = self.model.table_ref();
        let mut rows = Vec::with_capacity(instances.len());
        for instance in &instances {
            if instance.model().qualified_name() != self.model.qualified_name() {
                return Err(Error::InvalidData(format!(
                    "cannot bulk-create {} through the {} manager",
                    instance.model().name,
                    self.model.name
                )));
            }
            instance.validate()?;
            let mut row = instance.to_storage_record()?;
            if instance.pk().is_null() {
                row.remove(&table.primary_key);
            }
            rows.push(row);
        }

        let backend = self.db.backend(None)?;
        let stored = backend.bulk_insert(&table, rows).await?;
        for (instance, row) in instances.iter_mut().zip(&stored) {
            instance.hydrate(row)?;
            instance.mark_saved(backend.name());
        }
        debug!(model = %self.model.name, created = stored.len(), "bulk created");
        Ok(instances)
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("model", &self.model.qualified_name())
            .finish()
    }
}
