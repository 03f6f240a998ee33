//! Schema editor for the key-value backend.
//!
//! Tables are schemaless at the row level, so most operations only rewrite
//! `_meta/tables/*` and `_meta/indexes/*`. Adding a field with a default,
//! renaming a column and changing a column's uniqueness also touch rows or
//! unique claims.

use async_trait::async_trait;
use ormkv_proto::{Row, Value};
use sled::Tree;
use tracing::{debug, info, instrument};

use super::engine::KvBackend;
use super::key::row_prefix;
use super::record::StoredRow;
use super::unique;
use crate::backend::{ColumnMeta, IndexMeta, StorageBackend, TableMeta};
use crate::error::Error;
use crate::migration::{FieldState, IndexState, ModelState, SchemaEditor};
use crate::model::LinkTable;

/// Applies migration operations to a [`KvBackend`].
pub struct KvSchemaEditor<'a> {
    backend: &'a KvBackend,
    tree: Tree,
}

impl<'a> KvSchemaEditor<'a> {
    pub(crate) fn new(backend: &'a KvBackend, tree: Tree) -> Self {
        Self { backend, tree }
    }

    fn column_meta(field: &FieldState, column: &str) -> ColumnMeta {
        ColumnMeta {
            name: column.to_string(),
            kind: field.kind.clone(),
            nullable: field.is_nullable(),
            unique: field.is_unique(),
            default: field.option("default").cloned(),
            deprecated: false,
        }
    }

    fn table_meta_for(model: &ModelState) -> TableMeta {
        let mut meta = TableMeta::new(model.table.clone(), model.table_ref().primary_key);
        meta.model = Some(model.qualified_name());
        meta.columns = model
            .fields
            .iter()
            .filter_map(|f| f.column.as_deref().map(|c| Self::column_meta(f, c)))
            .collect();
        meta
    }

    /// Metadata for a model's table, synthesised from the model when absent.
    async fn load_meta(&self, model: &ModelState) -> Result<TableMeta, Error> {
        Ok(self
            .backend
            .table_meta(&model.table)
            .await?
            .unwrap_or_else(|| Self::table_meta_for(model)))
    }

    fn link_tables(model: &ModelState) -> Vec<LinkTable> {
        model
            .fields
            .iter()
            .filter(|f| f.kind == "ManyToManyField")
            .filter_map(|f| {
                let target = f.option("to")?.as_str()?;
                let target_name = target.rsplit('.').next().unwrap_or(target);
                Some(LinkTable::layout(
                    &model.table,
                    &model.name,
                    &f.name,
                    target_name,
                    f.option("through").and_then(|v| v.as_str()),
                ))
            })
            .collect()
    }

    /// Storage value a field's default produces, if it has one.
    fn default_value(field: &FieldState) -> Result<Option<Value>, Error> {
        let def = field.to_field_def()?;
        match &def.options.default {
            Some(default) => {
                let value = def.clean(&default.produce())?;
                if value.is_null() {
                    return Ok(None);
                }
                def.to_storage(&value).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Rewrite every row of a table in batches. `edit` returns whether it
    /// changed the row.
    fn rewrite_rows(
        &self,
        table: &str,
        mut edit: impl FnMut(&mut Row) -> Result<bool, Error>,
    ) -> Result<usize, Error> {
        let batch_size = self.backend.config().backfill_batch_size.max(1);
        let mut batch = sled::Batch::default();
        let mut pending = 0;
        let mut rewritten = 0;

        for entry in self.tree.scan_prefix(row_prefix(table)) {
            let (key, bytes) = entry?;
            let stored = StoredRow::from_bytes(&bytes)?;
            let mut columns = stored.columns.clone();
            if !edit(&mut columns)? {
                continue;
            }
            batch.insert(key, stored.rewrite(columns).to_bytes()?);
            pending += 1;
            if pending == batch_size {
                self.tree.apply_batch(std::mem::take(&mut batch))?;
                rewritten += pending;
                pending = 0;
            }
        }
        if pending > 0 {
            self.tree.apply_batch(batch)?;
            rewritten += pending;
        }
        Ok(rewritten)
    }

    fn require_column<'f>(model: &ModelState, field: &'f FieldState) -> Result<&'f str, Error> {
        field.column.as_deref().ok_or_else(|| {
            Error::Unsupported(format!(
                "{}.{} has no column of its own",
                model.name, field.name
            ))
        })
    }
}

#[async_trait]
impl SchemaEditor for KvSchemaEditor<'_> {
    #[instrument(skip(self, model), fields(model = %model.qualified_name()))]
    async fn create_model(&self, model: &ModelState) -> Result<(), Error> {
        self.backend.create_table(&Self::table_meta_for(model)).await?;

        for link in Self::link_tables(model) {
            let mut meta = TableMeta::new(link.table.name.clone(), link.table.primary_key.clone());
            meta.model = Some(model.qualified_name());
            for column in [&link.table.primary_key, &link.source_column, &link.target_column] {
                meta.columns.push(ColumnMeta {
                    name: column.clone(),
                    kind: if column == &link.table.primary_key {
                        "AutoField".into()
                    } else {
                        "ForeignKey".into()
                    },
                    nullable: false,
                    unique: column == &link.table.primary_key,
                    default: None,
                    deprecated: false,
                });
            }
            self.backend.create_table(&meta).await?;
        }

        for index in &model.indexes {
            self.add_index(model, index).await?;
        }
        info!(table = %model.table, "model created");
        Ok(())
    }

    async fn deprecate_model(&self, model: &ModelState) -> Result<(), Error> {
        let mut meta = self.load_meta(model).await?;
        meta.deprecated = true;
        self.backend.create_table(&meta).await?;
        info!(table = %model.table, "model deprecated");
        Ok(())
    }

    #[instrument(skip(self, model, field), fields(table = %model.table, field = %field.name))]
    async fn add_field(&self, model: &ModelState, field: &FieldState) -> Result<(), Error> {
        let Some(column) = field.column.as_deref() else {
            // Many-to-many fields only need their link table.
            let mut single = model.clone();
            single.fields = vec![field.clone()];
            single.indexes.clear();
            for link in Self::link_tables(&single) {
                let mut meta = TableMeta::new(link.table.name.clone(), link.table.primary_key.clone());
                meta.model = Some(model.qualified_name());
                self.backend.create_table(&meta).await?;
            }
            return Ok(());
        };

        let mut meta = self.load_meta(model).await?;
        match meta.column_mut(column) {
            Some(existing) => *existing = Self::column_meta(field, column),
            None => meta.columns.push(Self::column_meta(field, column)),
        }
        self.backend.create_table(&meta).await?;

        if let Some(default) = Self::default_value(field)? {
            let computed = field
                .option("default")
                .is_some_and(|d| d.get("callable").is_some());
            let filled = self.rewrite_rows(&model.table, |row| {
                if row.get(column).is_some_and(|v| !v.is_null()) {
                    return Ok(false);
                }
                let value = if computed {
                    Self::default_value(field)?.unwrap_or(Value::Null)
                } else {
                    default.clone()
                };
                row.insert(column.to_string(), value);
                Ok(true)
            })?;
            debug!(rows = filled, "backfilled default");
        }

        if field.is_unique() {
            unique::rebuild_column(&self.tree, &model.table, column)?;
        }
        Ok(())
    }

    async fn deprecate_field(&self, model: &ModelState, field: &FieldState) -> Result<(), Error> {
        let Some(column) = field.column.as_deref() else {
            return Ok(());
        };
        let mut meta = self.load_meta(model).await?;
        match meta.column_mut(column) {
            Some(existing) => existing.deprecated = true,
            None => {
                let mut deprecated = Self::column_meta(field, column);
                deprecated.deprecated = true;
                meta.columns.push(deprecated);
            }
        }
        self.backend.create_table(&meta).await?;
        unique::clear_column(&self.tree, &model.table, column)?;
        debug!(table = %model.table, column, "field deprecated");
        Ok(())
    }

    async fn alter_field(
        &self,
        model: &ModelState,
        from: &FieldState,
        to: &FieldState,
    ) -> Result<(), Error> {
        if from.column != to.column {
            self.rename_field(model, from, to).await?;
        }
        let column = Self::require_column(model, to)?;

        let mut meta = self.load_meta(model).await?;
        let deprecated = meta.column(column).is_some_and(|c| c.deprecated);
        let mut altered = Self::column_meta(to, column);
        altered.deprecated = deprecated;
        match meta.column_mut(column) {
            Some(existing) => *existing = altered,
            None => meta.columns.push(altered),
        }
        self.backend.create_table(&meta).await?;

        match (from.is_unique(), to.is_unique()) {
            (false, true) => {
                let claimed = unique::rebuild_column(&self.tree, &model.table, column)?;
                debug!(table = %model.table, column, claimed, "column became unique");
            }
            (true, false) => {
                unique::clear_column(&self.tree, &model.table, column)?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn rename_field(
        &self,
        model: &ModelState,
        from: &FieldState,
        to: &FieldState,
    ) -> Result<(), Error> {
        let old = Self::require_column(model, from)?.to_string();
        let new = Self::require_column(model, to)?.to_string();
        if old == new {
            return Ok(());
        }

        let rewritten = self.rewrite_rows(&model.table, |row| {
            Ok(match row.remove(&old) {
                Some(value) => {
                    row.insert(new.clone(), value);
                    true
                }
                None => false,
            })
        })?;

        let mut meta = self.load_meta(model).await?;
        if let Some(column) = meta.column_mut(&old) {
            column.name = new.clone();
        }
        self.backend.create_table(&meta).await?;

        if from.is_unique() {
            unique::clear_column(&self.tree, &model.table, &old)?;
        }
        if to.is_unique() {
            unique::rebuild_column(&self.tree, &model.table, &new)?;
        }
        info!(table = %model.table, from = %old, to = %new, rows = rewritten, "column renamed");
        Ok(())
    }

    async fn add_index(&self, model: &ModelState, index: &IndexState) -> Result<(), Error> {
        let columns = index
            .fields
            .iter()
            .map(|f| model.column_of(f).unwrap_or(f).to_string())
            .collect();
        self.backend
            .create_index(&IndexMeta {
                table: model.table.clone(),
                name: index.name.clone(),
                columns,
                unique: index.unique,
            })
            .await
    }

    async fn remove_index(&self, model: &ModelState, index: &IndexState) -> Result<(), Error> {
        self.backend.drop_index(&model.table, &index.name).await?;
        Ok(())
    }

    async fn alter_unique_together(
        &self,
        model: &ModelState,
        groups: &[Vec<String>],
    ) -> Result<(), Error> {
        // Composite constraints are recorded in migration state only.
        debug!(table = %model.table, groups = groups.len(), "unique_together recorded");
        Ok(())
    }
}
