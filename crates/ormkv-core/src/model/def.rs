//! Model definitions.

use std::collections::HashSet;

use ormkv_proto::TableRef;

use crate::error::Error;
use crate::field::{FieldDef, FieldKind};

/// Alias accepted wherever a field name is, meaning the primary key.
pub const PK_ALIAS: &str = "pk";

/// A secondary index declared on a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Indexed field names, in order.
    pub fields: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

/// Link table backing a many-to-many field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkTable {
    /// Storage table.
    pub table: TableRef,
    /// Column holding the owning instance's key.
    pub source_column: String,
    /// Column holding the related instance's key.
    pub target_column: String,
}

/// Static schema of a model.
///
/// Built once through [`ModelBuilder`] and shared behind an `Arc` by the
/// registry and every instance of the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDef {
    /// Application label.
    pub app_label: String,
    /// Model name.
    pub name: String,
    /// Storage table name.
    pub table: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldDef>,
    /// Secondary indexes.
    pub indexes: Vec<IndexDef>,
    /// Field groups that must be unique together.
    pub unique_together: Vec<Vec<String>>,
    /// Default ordering (`name` / `-name`).
    pub ordering: Vec<String>,
    /// Abstract models contribute fields to subclasses and have no table.
    pub is_abstract: bool,
    pk_index: usize,
}

impl ModelDef {
    /// Start building a model.
    pub fn builder(app_label: impl Into<String>, name: impl Into<String>) -> ModelBuilder {
        ModelBuilder::new(app_label, name)
    }

    /// Fully qualified `app.Model` name.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.app_label, self.name)
    }

    /// Look up a field by name; `pk` resolves to the primary key.
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.field_index(name).map(|i| &self.fields[i])
    }

    /// Position of a field by name; `pk` resolves to the primary key.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        if name == PK_ALIAS && !self.is_abstract {
            return Some(self.pk_index);
        }
        self.fields.iter().position(|f| f.name == name)
    }

    /// Look up a field by storage column.
    pub fn field_by_column(&self, column: &str) -> Option<&FieldDef> {
        self.fields
            .iter()
            .find(|f| f.has_column() && f.column() == column)
    }

    /// Fail with [`Error::Registry`] when the model is abstract. Abstract
    /// models have no table and possibly no primary key.
    pub fn ensure_concrete(&self) -> Result<(), Error> {
        if self.is_abstract {
            return Err(Error::Registry(format!(
                "{} is abstract and has no table",
                self.qualified_name()
            )));
        }
        Ok(())
    }

    /// The primary key field. Only meaningful for concrete models; see
    /// [`ModelDef::ensure_concrete`].
    pub fn pk_field(&self) -> &FieldDef {
        &self.fields[self.pk_index]
    }

    /// Position of the primary key field.
    pub fn pk_index(&self) -> usize {
        self.pk_index
    }

    /// The primary key column.
    pub fn pk_column(&self) -> String {
        self.pk_field().column()
    }

    /// Fields that store a column, in declaration order.
    pub fn column_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.has_column())
    }

    /// Storage column names, in declaration order.
    pub fn columns(&self) -> Vec<String> {
        self.column_fields().map(FieldDef::column).collect()
    }

    /// Foreign-key and one-to-one fields.
    pub fn foreign_keys(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.kind.is_foreign_key())
    }

    /// Storage-level table description used by backends.
    pub fn table_ref(&self) -> TableRef {
        let pk = self.pk_field();
        let mut table = TableRef::new(self.table.clone())
            .with_primary_key(pk.column(), matches!(pk.kind, FieldKind::Auto));
        for field in self.column_fields() {
            if field.is_unique() && !field.is_primary_key() {
                table = table.with_unique(field.column());
            }
        }
        table
    }

    /// Link table for a many-to-many field, given the relation's target model.
    pub fn link_table(&self, field: &str, target: &ModelDef) -> Result<LinkTable, Error> {
        let def = self
            .field(field)
            .ok_or_else(|| Error::InvalidLookup(format!("{} has no field '{}'", self.name, field)))?;
        let FieldKind::ManyToMany(rel) = &def.kind else {
            return Err(Error::InvalidLookup(format!(
                "{}.{} is not a many-to-many field",
                self.name, field
            )));
        };

        Ok(LinkTable::layout(
            &self.table,
            &self.name,
            &def.name,
            &target.name,
            rel.through.as_deref(),
        ))
    }
}

impl LinkTable {
    /// Link table layout for field `field` of model `source` (stored in
    /// `source_table`) pointing at model `target`.
    ///
    /// The table defaults to `<source_table>_<field>`; columns are
    /// `<source>_id` / `<target>_id`, or `from_<m>_id` / `to_<m>_id` when a
    /// model relates to itself.
    pub fn layout(
        source_table: &str,
        source: &str,
        field: &str,
        target: &str,
        through: Option<&str>,
    ) -> Self {
        let table_name = through
            .map(str::to_string)
            .unwrap_or_else(|| format!("{source_table}_{field}"));
        let source = source.to_lowercase();
        let target = target.to_lowercase();
        let (source_column, target_column) = if source == target {
            (format!("from_{source}_id"), format!("to_{target}_id"))
        } else {
            (format!("{source}_id"), format!("{target}_id"))
        };
        Self {
            table: TableRef::new(table_name),
            source_column,
            target_column,
        }
    }
}

/// Builder for [`ModelDef`].
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    app_label: String,
    name: String,
    table: Option<String>,
    fields: Vec<FieldDef>,
    indexes: Vec<IndexDef>,
    unique_together: Vec<Vec<String>>,
    ordering: Vec<String>,
    is_abstract: bool,
}

impl ModelBuilder {
    /// Create a builder.
    pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            app_label: app_label.into(),
            name: name.into(),
            table: None,
            fields: Vec::new(),
            indexes: Vec::new(),
            unique_together: Vec::new(),
            ordering: Vec::new(),
            is_abstract: false,
        }
    }

    /// Add a field, binding its name.
    pub fn field(mut self, name: impl Into<String>, mut field: FieldDef) -> Self {
        field.name = name.into();
        self.fields.push(field);
        self
    }

    /// Inherit the fields of an abstract model.
    pub fn extends(mut self, parent: &ModelDef) -> Self {
        let own = std::mem::take(&mut self.fields);
        self.fields = parent.fields.clone();
        self.fields.extend(own);
        self.indexes.extend(parent.indexes.iter().cloned());
        if self.ordering.is_empty() {
            self.ordering = parent.ordering.clone();
        }
        self
    }

    /// Override the table name.
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Declare a secondary index.
    pub fn index(mut self, name: impl Into<String>, fields: &[&str]) -> Self {
        self.indexes.push(IndexDef {
            name: name.into(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            unique: false,
        });
        self
    }

    /// Declare a group of fields that must be unique together.
    pub fn unique_together(mut self, fields: &[&str]) -> Self {
        self.unique_together
            .push(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Set the default ordering.
    pub fn ordering(mut self, ordering: &[&str]) -> Self {
        self.ordering = ordering.iter().map(|o| o.to_string()).collect();
        self
    }

    /// Mark the model abstract.
    pub fn abstract_model(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Validate and build the definition.
    ///
    /// A concrete model without a declared primary key receives an `id`
    /// auto field in first position.
    pub fn build(mut self) -> Result<ModelDef, Error> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.name.is_empty() || field.name == PK_ALIAS || field.name.contains("__") {
                return Err(Error::Registry(format!(
                    "{}: invalid field name '{}'",
                    self.name, field.name
                )));
            }
            if !seen.insert(field.name.clone()) {
                return Err(Error::Registry(format!(
                    "{}: duplicate field '{}'",
                    self.name, field.name
                )));
            }
        }

        let pk_positions: Vec<usize> = self
            .fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_primary_key())
            .map(|(i, _)| i)
            .collect();

        let pk_index = match pk_positions.as_slice() {
            [] if self.is_abstract => 0,
            [] => {
                if seen.contains("id") {
                    return Err(Error::Registry(format!(
                        "{}: field 'id' must be the primary key when no other is declared",
                        self.name
                    )));
                }
                let mut id = FieldDef::auto();
                id.name = "id".to_string();
                self.fields.insert(0, id);
                0
            }
            [single] => *single,
            _ => {
                return Err(Error::Registry(format!(
                    "{}: more than one primary key declared",
                    self.name
                )));
            }
        };

        if !self.is_abstract {
            let pk = &self.fields[pk_index];
            if pk.options.null || !pk.has_column() {
                return Err(Error::Registry(format!(
                    "{}: primary key '{}' must be a non-null column",
                    self.name, pk.name
                )));
            }
        }

        let mut columns = HashSet::new();
        for field in self.fields.iter().filter(|f| f.has_column()) {
            if !columns.insert(field.column()) {
                return Err(Error::Registry(format!(
                    "{}: column '{}' is used twice",
                    self.name,
                    field.column()
                )));
            }
        }

        let names: HashSet<&str> = self.fields.iter().map(|f| f.name.as_str()).collect();
        let declared = self
            .indexes
            .iter()
            .flat_map(|i| i.fields.iter())
            .chain(self.unique_together.iter().flatten())
            .chain(self.ordering.iter());
        for name in declared {
            let name = name.trim_start_matches('-');
            if name != PK_ALIAS && !names.contains(name) {
                return Err(Error::Registry(format!(
                    "{}: unknown field '{}' in model options",
                    self.name, name
                )));
            }
        }

        let table = self.table.unwrap_or_else(|| {
            format!("{}_{}", self.app_label, self.name).to_lowercase()
        });

        Ok(ModelDef {
            app_label: self.app_label,
            name: self.name,
            table,
            fields: self.fields,
            indexes: self.indexes,
            unique_together: self.unique_together,
            ordering: self.ordering,
            is_abstract: self.is_abstract,
            pk_index,
        })
    }
}
