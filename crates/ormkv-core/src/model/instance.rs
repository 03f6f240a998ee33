//! Model instances.
//!
//! An [`Instance`] holds one value per field of its [`ModelDef`], in
//! declaration order, together with the set of fields changed since the last
//! load or save, whether it has been persisted, and the backend it came from.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use ormkv_proto::{Filter, Query, Row, Value};
use tracing::debug;

use super::def::ModelDef;
use crate::backend::StorageBackend;
use crate::database::Database;
use crate::error::{Error, ValidationErrors};
use crate::field::{FieldDef, FieldKind, FieldValue, OnDelete};
use crate::query::QuerySet;

static NULL: FieldValue = FieldValue::Null;

/// What [`Instance::save`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// A new row was written.
    Inserted,
    /// An existing row was updated.
    Updated,
}

/// A single model object.
#[derive(Clone)]
pub struct Instance {
    model: Arc<ModelDef>,
    values: Vec<FieldValue>,
    dirty: BTreeSet<String>,
    persisted: bool,
    backend: Option<String>,
    related: HashMap<String, Instance>,
}

impl Instance {
    /// Create an unsaved instance with every field at its initial value.
    pub fn new(model: Arc<ModelDef>) -> Self {
        let values = model.fields.iter().map(FieldDef::initial_value).collect();
        Self {
            model,
            values,
            dirty: BTreeSet::new(),
            persisted: false,
            backend: None,
            related: HashMap::new(),
        }
    }

    /// Build a persisted instance from a storage record.
    pub fn from_record(
        model: Arc<ModelDef>,
        record: &Row,
        backend: Option<&str>,
    ) -> Result<Self, Error> {
        let mut instance = Self {
            values: vec![FieldValue::Null; model.fields.len()],
            model,
            dirty: BTreeSet::new(),
            persisted: true,
            backend: backend.map(str::to_string),
            related: HashMap::new(),
        };
        instance.hydrate(record)?;
        instance.dirty.clear();
        Ok(instance)
    }

    /// The model definition.
    pub fn model(&self) -> &Arc<ModelDef> {
        &self.model
    }

    /// Field definitions, in declaration order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.model.fields
    }

    fn index_of(&self, name: &str) -> Result<usize, Error> {
        self.model.field_index(name).ok_or_else(|| {
            Error::InvalidLookup(format!("{} has no field '{}'", self.model.name, name))
        })
    }

    /// Current value of a field. Foreign keys yield the related key.
    pub fn get(&self, name: &str) -> Result<&FieldValue, Error> {
        Ok(&self.values[self.index_of(name)?])
    }

    /// Set a field, coercing the value to the field's canonical form.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<(), Error> {
        let index = self.index_of(name)?;
        let field = &self.model.fields[index];
        if !field.has_column() {
            return Err(Error::Unsupported(format!(
                "{}.{} is many-to-many; use m2m_add / m2m_remove",
                self.model.name, field.name
            )));
        }
        let value = field.clean(&value.into())?;
        let name = field.name.clone();
        if field.kind.is_foreign_key() && self.values[index] != value {
            self.related.remove(&name);
        }
        self.values[index] = value;
        self.dirty.insert(name);
        Ok(())
    }

    /// Primary key value; null while the backend has not assigned one.
    pub fn pk(&self) -> &FieldValue {
        self.values.get(self.model.pk_index()).unwrap_or(&NULL)
    }

    /// Whether the instance has been loaded from or saved to a backend.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Fields changed since the last load or save.
    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    /// Backend the instance was last loaded from or saved to.
    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    /// Storage record keyed by column.
    pub fn to_storage_record(&self) -> Result<Row, Error> {
        let mut row = Row::new();
        for (field, value) in self.model.fields.iter().zip(&self.values) {
            if field.has_column() {
                row.insert(field.column(), field.to_storage(value)?);
            }
        }
        Ok(row)
    }

    /// Load values from a record keyed by column or field name. The column
    /// name wins when both are present; fields absent from the record keep
    /// their current value.
    pub fn hydrate(&mut self, record: &Row) -> Result<(), Error> {
        for (index, field) in self.model.fields.iter().enumerate() {
            if !field.has_column() {
                continue;
            }
            let raw = record
                .get(&field.column())
                .or_else(|| record.get(&field.name));
            if let Some(raw) = raw {
                self.values[index] = field.from_storage(raw)?;
            }
        }
        Ok(())
    }

    /// Validate every field, collecting errors by field name.
    pub fn validate(&self) -> Result<(), Error> {
        let mut errors = ValidationErrors::new();
        for (field, value) in self.model.fields.iter().zip(&self.values) {
            if !field.has_column() {
                continue;
            }
            let outcome = field.validate(value);
            if !outcome.valid {
                errors.extend(field.name.clone(), outcome.errors);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    /// Stamp `auto_now` fields, and `auto_now_add` fields of unsaved instances.
    fn stamp_auto_fields(&mut self) -> Vec<String> {
        let now = Utc::now();
        let mut stamped = Vec::new();
        for (index, field) in self.model.fields.iter().enumerate() {
            if let FieldKind::DateTime {
                auto_now,
                auto_now_add,
            } = field.kind
            {
                if auto_now || (auto_now_add && !self.persisted) {
                    self.values[index] = FieldValue::DateTime(now);
                    self.dirty.insert(field.name.clone());
                    stamped.push(field.column());
                }
            }
        }
        stamped
    }

    pub(crate) fn mark_saved(&mut self, backend: &str) {
        self.persisted = true;
        self.backend = Some(backend.to_string());
        self.dirty.clear();
    }

    /// Save through the instance's own backend, or the default one.
    pub async fn save(&mut self, db: &Database) -> Result<SaveOutcome, Error> {
        let backend = db.backend(self.backend.as_deref())?;
        self.save_to(backend.as_ref()).await
    }

    /// Save through a named backend.
    pub async fn save_using(&mut self, db: &Database, backend: &str) -> Result<SaveOutcome, Error> {
        let backend = db.backend(Some(backend))?;
        self.save_to(backend.as_ref()).await
    }

    /// Insert when the key is unset, otherwise update dirty columns.
    ///
    /// A key assigned by the caller on a never-persisted instance is first
    /// tried as an update and falls back to an insert when no row exists.
    /// Saving to a backend other than the one the instance came from writes
    /// the full record the same way.
    pub async fn save_to(&mut self, backend: &dyn StorageBackend) -> Result<SaveOutcome, Error> {
        self.model.ensure_concrete()?;
        let stamped = self.stamp_auto_fields();
        self.validate()?;
        let table = self.model.table_ref();
        let record = self.to_storage_record()?;

        if self.pk().is_null() {
            let mut row = record;
            row.remove(&table.primary_key);
            let stored = backend.insert(&table, row).await?;
            self.hydrate(&stored)?;
            self.mark_saved(backend.name());
            debug!(model = %self.model.name, pk = %self.pk(), "inserted");
            return Ok(SaveOutcome::Inserted);
        }

        let id = self.model.pk_field().to_storage(self.pk())?;
        let persisted_here =
            self.persisted && self.backend.as_deref().map_or(true, |b| b == backend.name());
        let changes: Row = if persisted_here {
            let mut columns: BTreeSet<String> = self
                .dirty
                .iter()
                .filter_map(|name| self.model.field(name))
                .filter(|f| f.has_column())
                .map(FieldDef::column)
                .collect();
            columns.extend(stamped);
            columns.remove(&table.primary_key);
            record
                .iter()
                .filter(|(column, _)| columns.contains(*column))
                .map(|(c, v)| (c.clone(), v.clone()))
                .collect()
        } else {
            record.clone()
        };

        match backend.update(&table, &id, changes).await {
            Ok(stored) => {
                self.hydrate(&stored)?;
                self.mark_saved(backend.name());
                Ok(SaveOutcome::Updated)
            }
            Err(Error::NotFound(_)) if !persisted_here => {
                let stored = backend.insert(&table, record).await?;
                self.hydrate(&stored)?;
                self.mark_saved(backend.name());
                Ok(SaveOutcome::Inserted)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete the row, applying `on_delete` rules of relations that point at
    /// this model. Clears the key and the persisted flag.
    pub async fn delete(&mut self, db: &Database) -> Result<bool, Error> {
        self.model.ensure_concrete()?;
        if self.pk().is_null() {
            return Err(Error::InvalidData(format!(
                "{} instance has no primary key and cannot be deleted",
                self.model.name
            )));
        }
        let backend = db.backend(self.backend.as_deref())?;
        let id = self.model.pk_field().to_storage(self.pk())?;

        apply_on_delete(db, backend.as_ref(), &self.model, vec![id.clone()]).await?;

        let existed = backend.delete(&self.model.table_ref(), &id).await?;
        let pk = self.model.pk_index();
        self.values[pk] = FieldValue::Null;
        self.persisted = false;
        self.related.clear();
        Ok(existed)
    }

    /// Reload every field from the backend.
    pub async fn refresh(&mut self, db: &Database) -> Result<(), Error> {
        self.model.ensure_concrete()?;
        let backend = db.backend(self.backend.as_deref())?;
        let table = self.model.table_ref();
        let id = self.model.pk_field().to_storage(self.pk())?;
        let query = Query::new(table.clone()).with_filter(Filter::eq(table.primary_key, id));
        let row = backend
            .execute(&query)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("{} with pk {}", self.model.name, self.pk())))?;
        self.hydrate(&row)?;
        self.dirty.clear();
        self.related.clear();
        self.persisted = true;
        self.backend = Some(backend.name().to_string());
        Ok(())
    }

    fn relation_field(&self, name: &str) -> Result<&FieldDef, Error> {
        let field = &self.model.fields[self.index_of(name)?];
        if !field.kind.is_foreign_key() {
            return Err(Error::InvalidLookup(format!(
                "{}.{} is not a foreign key",
                self.model.name, name
            )));
        }
        Ok(field)
    }

    /// Key held by a foreign-key field. Never fetches.
    pub fn fk_id(&self, name: &str) -> Result<&FieldValue, Error> {
        self.relation_field(name)?;
        self.get(name)
    }

    /// Cached related instance; fails with [`Error::RelationNotLoaded`]
    /// until fetched or set.
    pub fn related(&self, name: &str) -> Result<&Instance, Error> {
        let field = self.relation_field(name)?;
        self.related
            .get(&field.name)
            .ok_or_else(|| Error::RelationNotLoaded {
                model: self.model.name.clone(),
                field: field.name.clone(),
            })
    }

    /// Point a foreign key at `target` and cache it.
    pub fn set_related(&mut self, name: &str, target: Instance) -> Result<(), Error> {
        let field_name = self.relation_field(name)?.name.clone();
        self.set(&field_name, target.pk().clone())?;
        self.related.insert(field_name, target);
        Ok(())
    }

    /// Fetch and cache the instance a foreign key points at. Returns `None`
    /// when the key is null.
    pub async fn fetch_related(&mut self, db: &Database, name: &str) -> Result<Option<&Instance>, Error> {
        let field_name = self.relation_field(name)?.name.clone();
        let id = self.get(&field_name)?.clone();
        if id.is_null() {
            self.related.remove(&field_name);
            return Ok(None);
        }
        let target = db.registry().related_model(&self.model, &field_name)?;
        let instance = QuerySet::new(db.clone(), target)
            .using_opt(self.backend.clone())
            .filter("pk", id)
            .get()
            .await?;
        self.related.insert(field_name.clone(), instance);
        Ok(self.related.get(&field_name))
    }

    /// Instances of other models pointing at this one through the reverse
    /// accessor `related_name`.
    pub async fn related_set(&self, db: &Database, related_name: &str) -> Result<QuerySet, Error> {
        let reverse = db
            .registry()
            .reverse_relation(&self.model.qualified_name(), related_name)
            .ok_or_else(|| {
                Error::InvalidLookup(format!(
                    "{} has no reverse relation '{}'",
                    self.model.name, related_name
                ))
            })?;
        let source = db.registry().require(&reverse.source_model)?;
        let field = source.field(&reverse.source_field).cloned().ok_or_else(|| {
            Error::Registry(format!(
                "{} lost field '{}'",
                source.name, reverse.source_field
            ))
        })?;

        let queryset = QuerySet::new(db.clone(), source.clone()).using_opt(self.backend.clone());
        if field.kind.is_foreign_key() {
            return Ok(queryset.filter(&field.name, self.pk().clone()));
        }

        // Reverse many-to-many: collect source keys from the link table.
        let link = source.link_table(&field.name, &self.model)?;
        let backend = db.backend(self.backend.as_deref())?;
        let id = self.model.pk_field().to_storage(self.pk())?;
        let rows = backend
            .execute(
                &Query::new(link.table.clone())
                    .with_filter(Filter::eq(link.target_column.clone(), id)),
            )
            .await?;
        let pk_field = source.pk_field();
        let ids = rows
            .iter()
            .filter_map(|row| row.get(&link.source_column))
            .map(|raw| pk_field.from_storage(raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(queryset.filter("pk__in", ids))
    }

    fn m2m_link(
        &self,
        db: &Database,
        name: &str,
    ) -> Result<(crate::model::LinkTable, Arc<ModelDef>, Value), Error> {
        self.model.ensure_concrete()?;
        let target = db.registry().related_model(&self.model, name)?;
        target.ensure_concrete()?;
        let link = self.model.link_table(name, &target)?;
        if self.pk().is_null() {
            return Err(Error::InvalidData(format!(
                "save {} before editing '{}'",
                self.model.name, name
            )));
        }
        let id = self.model.pk_field().to_storage(self.pk())?;
        Ok((link, target, id))
    }

    /// Keys of instances linked through a many-to-many field.
    pub async fn m2m_ids(&self, db: &Database, name: &str) -> Result<Vec<FieldValue>, Error> {
        let (link, target, id) = self.m2m_link(db, name)?;
        let backend = db.backend(self.backend.as_deref())?;
        let rows = backend
            .execute(&Query::new(link.table).with_filter(Filter::eq(link.source_column, id)))
            .await?;
        let pk_field = target.pk_field();
        rows.iter()
            .filter_map(|row| row.get(&link.target_column))
            .map(|raw| pk_field.from_storage(raw))
            .collect()
    }

    /// Instances linked through a many-to-many field.
    pub async fn m2m_related(&self, db: &Database, name: &str) -> Result<QuerySet, Error> {
        let ids = self.m2m_ids(db, name).await?;
        let target = db.registry().related_model(&self.model, name)?;
        Ok(QuerySet::new(db.clone(), target)
            .using_opt(self.backend.clone())
            .filter("pk__in", ids))
    }

    /// Link instances through a many-to-many field. Existing links are kept
    /// once. Returns the number of links created.
    pub async fn m2m_add(&self, db: &Database, name: &str, others: &[&Instance]) -> Result<usize, Error> {
        let (link, target, id) = self.m2m_link(db, name)?;
        let existing = self.m2m_ids(db, name).await?;
        let pk_field = target.pk_field();

        let mut rows = Vec::new();
        let mut seen = existing;
        for other in others {
            if other.pk().is_null() {
                return Err(Error::InvalidData(format!(
                    "cannot link an unsaved {} through '{}'",
                    target.name, name
                )));
            }
            if seen.contains(other.pk()) {
                continue;
            }
            seen.push(other.pk().clone());
            let mut row = Row::new();
            row.insert(link.source_column.clone(), id.clone());
            row.insert(link.target_column.clone(), pk_field.to_storage(other.pk())?);
            rows.push(row);
        }
        if rows.is_empty() {
            return Ok(0);
        }
        let backend = db.backend(self.backend.as_deref())?;
        Ok(backend.bulk_insert(&link.table, rows).await?.len())
    }

    /// Remove many-to-many links. Returns the number removed.
    pub async fn m2m_remove(&self, db: &Database, name: &str, others: &[&Instance]) -> Result<usize, Error> {
        let (link, target, id) = self.m2m_link(db, name)?;
        let pk_field = target.pk_field();
        let ids = others
            .iter()
            .map(|o| pk_field.to_storage(o.pk()))
            .collect::<Result<Vec<_>, _>>()?;
        let query = Query::new(link.table)
            .with_filter(Filter::eq(link.source_column, id))
            .with_filter(Filter::is_in(link.target_column, ids));
        db.backend(self.backend.as_deref())?.delete_many(&query).await
    }
}

/// Foreign-key fields of registered models that target `model`.
fn referencing(db: &Database, model: &ModelDef) -> Vec<(Arc<ModelDef>, FieldDef)> {
    let target = model.qualified_name();
    let mut out = Vec::new();
    for source in db.registry().models() {
        if source.is_abstract {
            continue;
        }
        for field in source.foreign_keys() {
            if field.kind.relation().is_some_and(|r| r.target.name() == target) {
                out.push((source.clone(), field.clone()));
            }
        }
    }
    out
}

/// Apply the `on_delete` rule of every relation pointing at `model` before
/// the rows keyed by `ids` are removed.
///
/// `Protect` is checked for every relation before anything is written.
/// Cascades delete the referencing rows first and then recurse into their
/// own referrers, so cycles terminate once the rows are gone.
pub(crate) fn apply_on_delete<'a>(
    db: &'a Database,
    backend: &'a dyn StorageBackend,
    model: &'a ModelDef,
    ids: Vec<Value>,
) -> Pin<Box<dyn Future<Output = Result<(), Error>> + Send + 'a>> {
    Box::pin(async move {
        if ids.is_empty() {
            return Ok(());
        }
        let referencing = referencing(db, model);
        let query_for = |source: &ModelDef, field: &FieldDef| {
            Query::new(source.table_ref()).with_filter(Filter::is_in(field.column(), ids.clone()))
        };

        for (source, field) in &referencing {
            if field.kind.relation().map(|r| r.on_delete) == Some(OnDelete::Protect) {
                let count = backend.count(&query_for(source, field)).await?;
                if count > 0 {
                    return Err(Error::Protected {
                        model: model.name.clone(),
                        source_model: source.name.clone(),
                        count,
                    });
                }
            }
        }

        for (source, field) in &referencing {
            let query = query_for(source, field);
            match field.kind.relation().map(|r| r.on_delete) {
                Some(OnDelete::Cascade) => {
                    let pk_column = source.pk_column();
                    let doomed: Vec<Value> = backend
                        .execute(&query.clone().with_projection(vec![pk_column.clone()]))
                        .await?
                        .into_iter()
                        .filter_map(|mut row| row.remove(&pk_column))
                        .collect();
                    if doomed.is_empty() {
                        continue;
                    }
                    let removed = backend
                        .delete_many(&Query::new(source.table_ref()).with_filter(Filter::is_in(
                            pk_column,
                            doomed.clone(),
                        )))
                        .await?;
                    debug!(source = %source.name, removed, "cascaded delete");
                    apply_on_delete(db, backend, source, doomed).await?;
                }
                Some(OnDelete::SetNull) => {
                    let mut changes = Row::new();
                    changes.insert(field.column(), Value::Null);
                    let nulled = backend.update_many(&query, changes).await?;
                    debug!(source = %source.name, nulled, "nulled references");
                }
                _ => {}
            }
        }
        Ok(())
    })
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.model.qualified_name() == other.model.qualified_name() && self.values == other.values
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct(&self.model.name);
        for (field, value) in self.model.fields.iter().zip(&self.values) {
            if field.has_column() {
                s.field(&field.name, value);
            }
        }
        s.field("persisted", &self.persisted).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::FieldDef;

    fn post() -> Arc<ModelDef> {
        Arc::new(
            ModelDef::builder("blog", "Post")
                .field("title", FieldDef::char(10))
                .field("views", FieldDef::integer().default(0))
                .field("author", FieldDef::foreign_key("Author").null())
                .field("created", FieldDef::datetime().auto_now_add())
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_new_instance_has_defaults() {
        let instance = Instance::new(post());
        assert_eq!(instance.get("views").unwrap(), &FieldValue::Int(0));
        assert!(instance.pk().is_null());
        assert!(!instance.is_persisted());
        assert_eq!(instance.dirty_fields().count(), 0);
    }

    #[test]
    fn test_set_coerces_and_tracks_dirty() {
        let mut instance = Instance::new(post());
        instance.set("views", "12").unwrap();
        assert_eq!(instance.get("views").unwrap(), &FieldValue::Int(12));
        assert_eq!(instance.dirty_fields().collect::<Vec<_>>(), vec!["views"]);
        assert!(instance.set("views", "many").is_err());
        assert!(instance.set("missing", 1).is_err());
    }

    #[test]
    fn test_hydrate_prefers_column_name() {
        let mut record = Row::new();
        record.insert("id".into(), Value::Int(4));
        record.insert("author_id".into(), Value::Int(9));
        record.insert("author".into(), Value::Int(1));
        record.insert("title".into(), Value::Text("Hi".into()));
        let instance = Instance::from_record(post(), &record, Some("default")).unwrap();
        assert_eq!(instance.fk_id("author").unwrap(), &FieldValue::Int(9));
        assert_eq!(instance.pk(), &FieldValue::Int(4));
        assert!(instance.is_persisted());
        assert_eq!(instance.backend(), Some("default"));
    }

    #[test]
    fn test_validate_collects_field_errors() {
        let mut instance = Instance::new(post());
        instance.set("title", "far too long a title").unwrap();
        match instance.validate() {
            Err(Error::Validation(errors)) => {
                assert_eq!(errors.for_field("title").len(), 1);
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_relation_not_loaded() {
        let mut instance = Instance::new(post());
        instance.set("author", 3).unwrap();
        assert!(matches!(
            instance.related("author"),
            Err(Error::RelationNotLoaded { .. })
        ));
        assert!(instance.fk_id("title").is_err());
    }

    #[test]
    fn test_storage_record_uses_columns() {
        let mut instance = Instance::new(post());
        instance.set("title", "Hi").unwrap();
        let record = instance.to_storage_record().unwrap();
        assert!(record.contains_key("author_id"));
        assert_eq!(record["title"], Value::Text("Hi".into()));
        assert_eq!(record["created"], Value::Null);
    }
}
