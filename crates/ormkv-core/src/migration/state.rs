//! Schema snapshots.
//!
//! [`ModelState`] and [`ProjectState`] are plain, serialisable descriptions of
//! model schemas. They are built from live definitions or by replaying
//! migration operations, and never mutated in place: every `with_*` /
//! `without_*` method returns a new value.

use std::collections::BTreeMap;
use std::sync::Arc;

use ormkv_proto::TableRef;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::field::{DefaultValue, FieldDef, FieldKind, OnDelete, Relation};
use crate::model::{ModelDef, ModelRegistry};

/// Snapshot of one field.
///
/// Options hold only values that differ from the field defaults, keyed by
/// their snake_case names (`max_length`, `null`, `to`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldState {
    /// Field name.
    pub name: String,
    /// Kind name (`CharField`, `ForeignKey`, ...).
    pub kind: String,
    /// Storage column; `None` for many-to-many fields.
    pub column: Option<String>,
    /// Non-default options.
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

impl FieldState {
    /// Create a field state with no options.
    pub fn new(name: impl Into<String>, kind: impl Into<String>, column: Option<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            column,
            options: BTreeMap::new(),
        }
    }

    /// Builder form for setting an option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// An option value.
    pub fn option(&self, key: &str) -> Option<&serde_json::Value> {
        self.options.get(key)
    }

    /// A boolean option, false when absent.
    pub fn flag(&self, key: &str) -> bool {
        self.option(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    /// Whether the field is the primary key.
    pub fn is_primary_key(&self) -> bool {
        self.flag("primary_key")
    }

    /// Whether stored values must be unique.
    pub fn is_unique(&self) -> bool {
        self.flag("unique") || self.is_primary_key() || self.kind == "OneToOneField"
    }

    /// Whether nulls are allowed.
    pub fn is_nullable(&self) -> bool {
        self.flag("null")
    }

    /// Snapshot a field definition.
    pub fn from_def(def: &FieldDef) -> Self {
        let mut state = Self::new(
            def.name.clone(),
            def.kind.name(),
            def.has_column().then(|| def.column()),
        );
        let opts = &def.options;
        let mut set = |key: &str, value: serde_json::Value| {
            state.options.insert(key.to_string(), value);
        };

        if opts.null {
            set("null", true.into());
        }
        if opts.blank {
            set("blank", true.into());
        }
        if opts.unique {
            set("unique", true.into());
        }
        if opts.primary_key {
            set("primary_key", true.into());
        }
        if !opts.editable {
            set("editable", false.into());
        }
        if opts.db_index {
            set("db_index", true.into());
        }
        if let Some(column) = &opts.db_column {
            set("db_column", column.clone().into());
        }
        if let Some(default) = &opts.default {
            set("default", default.describe());
        }

        match &def.kind {
            FieldKind::Char { max_length } | FieldKind::Email { max_length } => {
                set("max_length", (*max_length as u64).into());
            }
            FieldKind::Decimal {
                max_digits,
                decimal_places,
            } => {
                set("max_digits", (*max_digits).into());
                set("decimal_places", (*decimal_places).into());
            }
            FieldKind::DateTime {
                auto_now,
                auto_now_add,
            } => {
                if *auto_now {
                    set("auto_now", true.into());
                }
                if *auto_now_add {
                    set("auto_now_add", true.into());
                }
            }
            FieldKind::ForeignKey(rel) | FieldKind::OneToOne(rel) | FieldKind::ManyToMany(rel) => {
                set("to", rel.target.name().into());
                if let Some(related_name) = &rel.related_name {
                    set("related_name", related_name.clone().into());
                }
                if def.kind.is_foreign_key() {
                    set("on_delete", rel.on_delete.as_str().into());
                }
                if let Some(through) = &rel.through {
                    set("through", through.clone().into());
                }
            }
            _ => {}
        }
        state
    }

    /// Rebuild a field definition from the snapshot.
    pub fn to_field_def(&self) -> Result<FieldDef, Error> {
        let number = |key: &str| -> Result<u64, Error> {
            self.option(key).and_then(|v| v.as_u64()).ok_or_else(|| {
                Error::InvalidData(format!("field '{}' is missing option '{key}'", self.name))
            })
        };
        let relation = || -> Result<Relation, Error> {
            let target = self.option("to").and_then(|v| v.as_str()).ok_or_else(|| {
                Error::InvalidData(format!("relation '{}' has no target", self.name))
            })?;
            let mut rel = Relation::new(target);
            rel.related_name = self
                .option("related_name")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            rel.through = self.option("through").and_then(|v| v.as_str()).map(str::to_string);
            if let Some(on_delete) = self.option("on_delete") {
                rel.on_delete = serde_json::from_value::<OnDelete>(on_delete.clone())?;
            }
            Ok(rel)
        };

        let kind = match self.kind.as_str() {
            "AutoField" => FieldKind::Auto,
            "IntegerField" => FieldKind::Integer,
            "BigIntegerField" => FieldKind::BigInteger,
            "FloatField" => FieldKind::Float,
            "DecimalField" => FieldKind::Decimal {
                max_digits: number("max_digits")? as u32,
                decimal_places: number("decimal_places")? as u32,
            },
            "CharField" => FieldKind::Char {
                max_length: number("max_length")? as usize,
            },
            "EmailField" => FieldKind::Email {
                max_length: number("max_length")? as usize,
            },
            "TextField" => FieldKind::Text,
            "BooleanField" => FieldKind::Boolean,
            "DateField" => FieldKind::Date,
            "DateTimeField" => FieldKind::DateTime {
                auto_now: self.flag("auto_now"),
                auto_now_add: self.flag("auto_now_add"),
            },
            "UUIDField" => FieldKind::Uuid,
            "JSONField" => FieldKind::Json,
            "ForeignKey" => FieldKind::ForeignKey(relation()?),
            "OneToOneField" => FieldKind::OneToOne(relation()?),
            "ManyToManyField" => FieldKind::ManyToMany(relation()?),
            other => {
                return Err(Error::InvalidData(format!(
                    "unknown field kind '{other}' on '{}'",
                    self.name
                )))
            }
        };

        let mut def = FieldDef::new(kind);
        def.name = self.name.clone();
        def.options.null = self.flag("null");
        def.options.blank = self.flag("blank") || def.options.blank;
        def.options.unique = self.flag("unique");
        def.options.primary_key = self.is_primary_key();
        def.options.editable = self
            .option("editable")
            .and_then(|v| v.as_bool())
            .unwrap_or(def.options.editable);
        def.options.db_index = self.flag("db_index");
        def.options.db_column = self
            .option("db_column")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        def.options.default = self.option("default").map(DefaultValue::from_description);
        Ok(def)
    }
}

/// Snapshot of a secondary index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    /// Index name.
    pub name: String,
    /// Indexed field names.
    pub fields: Vec<String>,
    /// Whether the index is unique.
    #[serde(default)]
    pub unique: bool,
}

/// Snapshot of one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelState {
    /// Application label.
    pub app_label: String,
    /// Model name.
    pub name: String,
    /// Storage table.
    pub table: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldState>,
    /// Secondary indexes.
    #[serde(default)]
    pub indexes: Vec<IndexState>,
    /// Unique-together groups.
    #[serde(default)]
    pub unique_together: Vec<Vec<String>>,
    /// Abstract models have no table and are ignored by the comparator.
    #[serde(default)]
    pub is_abstract: bool,
}

impl ModelState {
    /// Create an empty model state with the default table name.
    pub fn new(app_label: impl Into<String>, name: impl Into<String>) -> Self {
        let app_label = app_label.into();
        let name = name.into();
        Self {
            table: format!("{}_{}", app_label, name).to_lowercase(),
            app_label,
            name,
            fields: Vec::new(),
            indexes: Vec::new(),
            unique_together: Vec::new(),
            is_abstract: false,
        }
    }

    /// `app_label.Name`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.app_label, self.name)
    }

    /// Look up a field.
    pub fn field(&self, name: &str) -> Option<&FieldState> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// The primary key field.
    pub fn pk_field(&self) -> Option<&FieldState> {
        self.fields.iter().find(|f| f.is_primary_key())
    }

    /// Storage column of a field, by field name.
    pub fn column_of(&self, field: &str) -> Option<&str> {
        self.field(field).and_then(|f| f.column.as_deref())
    }

    /// Table reference used for row writes.
    pub fn table_ref(&self) -> TableRef {
        let (pk, auto) = match self.pk_field() {
            Some(f) => (
                f.column.clone().unwrap_or_else(|| f.name.clone()),
                f.kind == "AutoField",
            ),
            None => ("id".to_string(), true),
        };
        let mut table = TableRef::new(self.table.clone()).with_primary_key(pk, auto);
        for field in &self.fields {
            if let (Some(column), true, false) =
                (&field.column, field.is_unique(), field.is_primary_key())
            {
                table = table.with_unique(column.clone());
            }
        }
        table
    }

    /// Snapshot a model definition.
    pub fn from_def(def: &ModelDef) -> Self {
        Self {
            app_label: def.app_label.clone(),
            name: def.name.clone(),
            table: def.table.clone(),
            fields: def.fields.iter().map(FieldState::from_def).collect(),
            indexes: def
                .indexes
                .iter()
                .map(|i| IndexState {
                    name: i.name.clone(),
                    fields: i.fields.clone(),
                    unique: i.unique,
                })
                .collect(),
            unique_together: def.unique_together.clone(),
            is_abstract: def.is_abstract,
        }
    }

    /// Copy with a field added, or replaced when the name exists.
    pub fn with_field(&self, field: FieldState) -> Self {
        let mut next = self.clone();
        match next.fields.iter_mut().find(|f| f.name == field.name) {
            Some(slot) => *slot = field,
            None => next.fields.push(field),
        }
        next
    }

    /// Copy without the named field.
    pub fn without_field(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.fields.retain(|f| f.name != name);
        next
    }

    /// Copy with a field renamed in place.
    pub fn with_renamed_field(&self, from: &str, to: &str) -> Self {
        let mut next = self.clone();
        for field in next.fields.iter_mut().filter(|f| f.name == from) {
            field.name = to.to_string();
            if field.column.as_deref() == Some(from) {
                field.column = Some(to.to_string());
            } else if field.column.as_deref() == Some(&format!("{from}_id")) {
                field.column = Some(format!("{to}_id"));
            }
        }
        for index in next.indexes.iter_mut() {
            for f in index.fields.iter_mut().filter(|f| f.as_str() == from) {
                *f = to.to_string();
            }
        }
        for group in next.unique_together.iter_mut() {
            for f in group.iter_mut().filter(|f| f.as_str() == from) {
                *f = to.to_string();
            }
        }
        next
    }

    /// Copy with an index added or replaced.
    pub fn with_index(&self, index: IndexState) -> Self {
        let mut next = self.without_index(&index.name);
        next.indexes.push(index);
        next
    }

    /// Copy without the named index.
    pub fn without_index(&self, name: &str) -> Self {
        let mut next = self.clone();
        next.indexes.retain(|i| i.name != name);
        next
    }

    /// Copy with new unique-together groups.
    pub fn with_unique_together(&self, groups: Vec<Vec<String>>) -> Self {
        let mut next = self.clone();
        next.unique_together = groups;
        next
    }
}

/// Snapshot of every model in a project, keyed by qualified name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectState {
    models: BTreeMap<String, Arc<ModelState>>,
}

impl ProjectState {
    /// An empty project.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from model states.
    pub fn from_models(models: impl IntoIterator<Item = ModelState>) -> Self {
        Self {
            models: models
                .into_iter()
                .map(|m| (m.qualified_name(), Arc::new(m)))
                .collect(),
        }
    }

    /// Snapshot every model in a registry.
    pub fn from_registry(registry: &ModelRegistry) -> Self {
        Self::from_models(registry.models().iter().map(|m| ModelState::from_def(m)))
    }

    /// Look up a model by qualified name.
    pub fn get(&self, name: &str) -> Option<&ModelState> {
        self.models.get(name).map(Arc::as_ref)
    }

    /// Whether a model exists.
    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    /// Models ordered by qualified name.
    pub fn models(&self) -> impl Iterator<Item = &ModelState> {
        self.models.values().map(Arc::as_ref)
    }

    /// Qualified model names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Number of models.
    pub fn len(&self) -> usize {
        self.models.len()
    }

    /// Whether the project has no models.
    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Copy with a model added or replaced.
    pub fn with_model(&self, model: ModelState) -> Self {
        let mut models = self.models.clone();
        models.insert(model.qualified_name(), Arc::new(model));
        Self { models }
    }

    /// Copy without the named model.
    pub fn without_model(&self, name: &str) -> Self {
        let mut models = self.models.clone();
        models.remove(name);
        Self { models }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author_def() -> ModelDef {
        ModelDef::builder("blog", "Author")
            .field("name", FieldDef::char(100))
            .field("email", FieldDef::email().unique())
            .field("joined", FieldDef::datetime().auto_now_add())
            .build()
            .unwrap()
    }

    #[test]
    fn test_field_state_options() {
        let state = ModelState::from_def(&author_def());
        let name = state.field("name").unwrap();
        assert_eq!(name.kind, "CharField");
        assert_eq!(name.option("max_length"), Some(&serde_json::json!(100)));
        assert!(name.option("null").is_none());

        let id = state.pk_field().unwrap();
        assert_eq!(id.name, "id");
        assert_eq!(id.kind, "AutoField");

        let table = state.table_ref();
        assert_eq!(table.primary_key, "id");
        assert!(table.auto_increment);
        assert_eq!(table.unique, vec!["email".to_string()]);
    }

    #[test]
    fn test_field_def_rebuild() {
        for field in ModelState::from_def(&author_def()).fields {
            let rebuilt = FieldState::from_def(&field.to_field_def().unwrap());
            assert_eq!(rebuilt, field);
        }
    }

    #[test]
    fn test_default_description_roundtrip() {
        let def = ModelDef::builder("shop", "Item")
            .field("stock", FieldDef::integer().default(5))
            .field("code", FieldDef::uuid().default_with(DefaultValue::NewUuid))
            .build()
            .unwrap();
        let state = ModelState::from_def(&def);
        assert_eq!(state.field("stock").unwrap().option("default"), Some(&serde_json::json!(5)));
        assert_eq!(
            state.field("code").unwrap().option("default"),
            Some(&serde_json::json!({ "callable": "uuid4" }))
        );
        let code = state.field("code").unwrap().to_field_def().unwrap();
        assert_eq!(code.options.default, Some(DefaultValue::NewUuid));
    }

    #[test]
    fn test_mutators_return_new_values() {
        let original = ModelState::from_def(&author_def());
        let renamed = original.with_renamed_field("name", "full_name");
        assert!(original.field("name").is_some());
        assert_eq!(renamed.column_of("full_name"), Some("full_name"));

        let project = ProjectState::from_models([original.clone()]);
        let emptied = project.without_model("blog.Author");
        assert!(project.contains("blog.Author"));
        assert!(emptied.is_empty());

        let grown = project.with_model(original.without_field("email"));
        assert!(project.get("blog.Author").unwrap().field("email").is_some());
        assert!(grown.get("blog.Author").unwrap().field("email").is_none());
    }
}
