//! Field definitions.
//!
//! A [`FieldDef`] describes one attribute of a model: its [`FieldKind`], the
//! declarative [`FieldOptions`] consumed by models and backends, and the
//! conversions between [`FieldValue`] and the storage [`Value`].
//!
//! Fields are constructed unbound and receive their name when the owning
//! model definition is built:
//!
//! ```ignore
//! let def = ModelDef::builder("blog", "Author")
//!     .field("name", FieldDef::char(100))
//!     .field("email", FieldDef::email().unique())
//!     .build()?;
//! ```

mod convert;
pub mod kind;
pub mod value;

use chrono::Utc;
use ormkv_proto::Value;

use crate::error::Error;

pub use kind::{FieldKind, OnDelete, Relation, RelationTarget};
pub use value::FieldValue;

/// Default maximum length for email fields.
pub const EMAIL_MAX_LENGTH: usize = 254;

/// Default value for a field.
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    /// A fixed value.
    Value(FieldValue),
    /// The current date and time.
    Now,
    /// The current date.
    Today,
    /// A fresh random UUID.
    NewUuid,
}

impl DefaultValue {
    /// Produce the default.
    pub fn produce(&self) -> FieldValue {
        match self {
            DefaultValue::Value(v) => v.clone(),
            DefaultValue::Now => FieldValue::DateTime(Utc::now()),
            DefaultValue::Today => FieldValue::Date(Utc::now().date_naive()),
            DefaultValue::NewUuid => FieldValue::Uuid(uuid::Uuid::new_v4()),
        }
    }

    /// JSON description recorded in migration state.
    ///
    /// Fixed values are stored as JSON; computed defaults as
    /// `{"callable": "now" | "today" | "uuid4"}`.
    pub fn describe(&self) -> serde_json::Value {
        let callable = |name: &str| serde_json::json!({ "callable": name });
        match self {
            DefaultValue::Value(v) => convert::to_json(v),
            DefaultValue::Now => callable("now"),
            DefaultValue::Today => callable("today"),
            DefaultValue::NewUuid => callable("uuid4"),
        }
    }

    /// Rebuild a default from its [`describe`](Self::describe) form.
    pub fn from_description(json: &serde_json::Value) -> Self {
        match json.get("callable").and_then(|c| c.as_str()) {
            Some("now") => DefaultValue::Now,
            Some("today") => DefaultValue::Today,
            Some("uuid4") => DefaultValue::NewUuid,
            _ => DefaultValue::Value(convert::from_json(json)),
        }
    }
}

/// Declarative field options.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOptions {
    /// Whether null is a valid value.
    pub null: bool,
    /// Whether the empty string is a valid value.
    pub blank: bool,
    /// Default value for new instances.
    pub default: Option<DefaultValue>,
    /// Whether values must be unique (case-insensitively for text).
    pub unique: bool,
    /// Whether this field is the primary key.
    pub primary_key: bool,
    /// Whether the field is user-editable.
    pub editable: bool,
    /// Whether the backend should index the column.
    pub db_index: bool,
    /// Explicit storage column name.
    pub db_column: Option<String>,
}

impl Default for FieldOptions {
    fn default() -> Self {
        Self {
            null: false,
            blank: false,
            default: None,
            unique: false,
            primary_key: false,
            editable: true,
            db_index: false,
            db_column: None,
        }
    }
}

/// Outcome of validating a value against a field.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Validation {
    /// Whether the value is acceptable.
    pub valid: bool,
    /// Error messages when not.
    pub errors: Vec<String>,
}

impl Validation {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![message.into()],
        }
    }
}

/// A field of a model.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Field name; empty until bound by the model builder.
    pub name: String,
    /// Field kind.
    pub kind: FieldKind,
    /// Declarative options.
    pub options: FieldOptions,
}

impl FieldDef {
    /// Create an unbound field of the given kind.
    pub fn new(kind: FieldKind) -> Self {
        let mut options = FieldOptions::default();
        if let FieldKind::DateTime {
            auto_now,
            auto_now_add,
        } = kind
        {
            if auto_now || auto_now_add {
                options.editable = false;
                options.blank = true;
            }
        }
        Self {
            name: String::new(),
            kind,
            options,
        }
    }

    /// Auto-incrementing integer primary key.
    pub fn auto() -> Self {
        Self::new(FieldKind::Auto).primary_key()
    }

    /// 32-bit integer.
    pub fn integer() -> Self {
        Self::new(FieldKind::Integer)
    }

    /// 64-bit integer.
    pub fn big_integer() -> Self {
        Self::new(FieldKind::BigInteger)
    }

    /// Floating point number.
    pub fn float() -> Self {
        Self::new(FieldKind::Float)
    }

    /// Fixed-point decimal.
    pub fn decimal(max_digits: u32, decimal_places: u32) -> Self {
        Self::new(FieldKind::Decimal {
            max_digits,
            decimal_places,
        })
    }

    /// Bounded string.
    pub fn char(max_length: usize) -> Self {
        Self::new(FieldKind::Char { max_length })
    }

    /// Email address.
    pub fn email() -> Self {
        Self::new(FieldKind::Email {
            max_length: EMAIL_MAX_LENGTH,
        })
    }

    /// Unbounded string.
    pub fn text() -> Self {
        Self::new(FieldKind::Text)
    }

    /// Boolean.
    pub fn boolean() -> Self {
        Self::new(FieldKind::Boolean)
    }

    /// Calendar date.
    pub fn date() -> Self {
        Self::new(FieldKind::Date)
    }

    /// UTC timestamp.
    pub fn datetime() -> Self {
        Self::new(FieldKind::DateTime {
            auto_now: false,
            auto_now_add: false,
        })
    }

    /// UUID.
    pub fn uuid() -> Self {
        Self::new(FieldKind::Uuid)
    }

    /// JSON document.
    pub fn json() -> Self {
        Self::new(FieldKind::Json)
    }

    /// Many-to-one relation to `target` (`"Model"`, `"app.Model"` or `"self"`).
    pub fn foreign_key(target: impl Into<String>) -> Self {
        Self::new(FieldKind::ForeignKey(Relation::new(target)))
    }

    /// One-to-one relation to `target`.
    pub fn one_to_one(target: impl Into<String>) -> Self {
        Self::new(FieldKind::OneToOne(Relation::new(target)))
    }

    /// Many-to-many relation to `target`.
    pub fn many_to_many(target: impl Into<String>) -> Self {
        Self::new(FieldKind::ManyToMany(Relation::new(target)))
    }

    /// Allow null values.
    pub fn null(mut self) -> Self {
        self.options.null = true;
        self
    }

    /// Allow empty strings.
    pub fn blank(mut self) -> Self {
        self.options.blank = true;
        self
    }

    /// Require unique values.
    pub fn unique(mut self) -> Self {
        self.options.unique = true;
        self
    }

    /// Make this field the primary key.
    pub fn primary_key(mut self) -> Self {
        self.options.primary_key = true;
        self.options.unique = true;
        self
    }

    /// Set a fixed default.
    pub fn default(mut self, value: impl Into<FieldValue>) -> Self {
        self.options.default = Some(DefaultValue::Value(value.into()));
        self
    }

    /// Set a computed default.
    pub fn default_with(mut self, default: DefaultValue) -> Self {
        self.options.default = Some(default);
        self
    }

    /// Mark the field as not user-editable.
    pub fn not_editable(mut self) -> Self {
        self.options.editable = false;
        self
    }

    /// Request a backend index on the column.
    pub fn db_index(mut self) -> Self {
        self.options.db_index = true;
        self
    }

    /// Override the storage column name.
    pub fn db_column(mut self, column: impl Into<String>) -> Self {
        self.options.db_column = Some(column.into());
        self
    }

    /// Stamp the current time on every save.
    pub fn auto_now(mut self) -> Self {
        if let FieldKind::DateTime { auto_now, .. } = &mut self.kind {
            *auto_now = true;
            self.options.editable = false;
            self.options.blank = true;
        }
        self
    }

    /// Stamp the current time on the first save.
    pub fn auto_now_add(mut self) -> Self {
        if let FieldKind::DateTime { auto_now_add, .. } = &mut self.kind {
            *auto_now_add = true;
            self.options.editable = false;
            self.options.blank = true;
        }
        self
    }

    /// Name of the reverse accessor on the relation target.
    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        if let Some(rel) = self.kind.relation_mut() {
            rel.related_name = Some(name.into());
        }
        self
    }

    /// Delete behaviour for relations.
    pub fn on_delete(mut self, on_delete: OnDelete) -> Self {
        if let Some(rel) = self.kind.relation_mut() {
            rel.on_delete = on_delete;
        }
        self
    }

    /// Explicit link table for many-to-many relations.
    pub fn through(mut self, table: impl Into<String>) -> Self {
        if let FieldKind::ManyToMany(rel) = &mut self.kind {
            rel.through = Some(table.into());
        }
        self
    }

    /// Storage column name: `db_column`, `<name>_id` for foreign keys, or the name.
    pub fn column(&self) -> String {
        if let Some(column) = &self.options.db_column {
            return column.clone();
        }
        if self.kind.is_foreign_key() {
            format!("{}_id", self.name)
        } else {
            self.name.clone()
        }
    }

    /// Whether the field stores a column.
    pub fn has_column(&self) -> bool {
        self.kind.has_column()
    }

    /// Whether the backend must enforce uniqueness.
    pub fn is_unique(&self) -> bool {
        self.options.unique || self.options.primary_key || matches!(self.kind, FieldKind::OneToOne(_))
    }

    /// Whether the field is the primary key.
    pub fn is_primary_key(&self) -> bool {
        self.options.primary_key
    }

    /// Initial value for a new instance.
    pub fn initial_value(&self) -> FieldValue {
        match &self.options.default {
            Some(default) => default.produce(),
            None => FieldValue::Null,
        }
    }

    /// Validate a value. Pure; never touches a backend.
    pub fn validate(&self, value: &FieldValue) -> Validation {
        if value.is_null() {
            if self.options.null || matches!(self.kind, FieldKind::Auto) {
                return Validation::ok();
            }
            return Validation::fail("this field cannot be null");
        }

        let coerced = match convert::coerce(&self.kind, value) {
            Ok(v) => v,
            Err(message) => return Validation::fail(message),
        };

        let mut errors = Vec::new();
        if let FieldValue::Text(s) = &coerced {
            if s.is_empty() && !self.options.blank {
                errors.push("this field cannot be blank".to_string());
            }
            match &self.kind {
                FieldKind::Char { max_length } | FieldKind::Email { max_length } => {
                    let len = s.chars().count();
                    if len > *max_length {
                        errors.push(format!(
                            "ensure this value has at most {max_length} characters (it has {len})"
                        ));
                    }
                }
                _ => {}
            }
            if matches!(self.kind, FieldKind::Email { .. }) && !s.is_empty() && !is_email(s) {
                errors.push(format!("'{s}' is not a valid email address"));
            }
        }

        Validation {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Convert an in-memory value to storage form.
    pub fn to_storage(&self, value: &FieldValue) -> Result<Value, Error> {
        convert::to_storage(&self.kind, value).map_err(|e| Error::validation(&self.name, e))
    }

    /// Convert a storage value to in-memory form.
    pub fn from_storage(&self, raw: &Value) -> Result<FieldValue, Error> {
        convert::from_storage(&self.kind, raw).map_err(|e| {
            Error::Deserialization(format!("field '{}': {}", self.name, e))
        })
    }

    /// Coerce a value into canonical in-memory form without storing it.
    pub fn clean(&self, value: &FieldValue) -> Result<FieldValue, Error> {
        if value.is_null() {
            return Ok(FieldValue::Null);
        }
        convert::coerce(&self.kind, value).map_err(|e| Error::validation(&self.name, e))
    }
}

fn is_email(s: &str) -> bool {
    if s.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && domain.split('.').all(|part| !part.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(mut field: FieldDef, name: &str) -> FieldDef {
        field.name = name.to_string();
        field
    }

    #[test]
    fn test_char_validation() {
        let field = named(FieldDef::char(5), "code");
        assert!(field.validate(&"abc".into()).valid);

        let too_long = field.validate(&"abcdef".into());
        assert!(!too_long.valid);
        assert!(too_long.errors[0].contains("at most 5"));

        assert!(!field.validate(&"".into()).valid);
        assert!(named(FieldDef::char(5).blank(), "code").validate(&"".into()).valid);
    }

    #[test]
    fn test_null_handling() {
        let field = named(FieldDef::integer(), "age");
        assert!(!field.validate(&FieldValue::Null).valid);
        assert!(named(FieldDef::integer().null(), "age").validate(&FieldValue::Null).valid);
        assert!(named(FieldDef::auto(), "id").validate(&FieldValue::Null).valid);
        assert_eq!(field.to_storage(&FieldValue::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_email_validation() {
        let field = named(FieldDef::email(), "email");
        assert!(field.validate(&"a@x.com".into()).valid);
        assert!(!field.validate(&"not-an-email".into()).valid);
        assert!(!field.validate(&"a@x".into()).valid);
        assert!(!field.validate(&"a b@x.com".into()).valid);
    }

    #[test]
    fn test_column_names() {
        assert_eq!(named(FieldDef::foreign_key("Author"), "author").column(), "author_id");
        assert_eq!(named(FieldDef::text().db_column("body_text"), "body").column(), "body_text");
        assert_eq!(named(FieldDef::text(), "body").column(), "body");
    }

    #[test]
    fn test_auto_timestamps_are_not_editable() {
        let field = FieldDef::datetime().auto_now_add();
        assert!(!field.options.editable);
        assert!(matches!(
            field.kind,
            FieldKind::DateTime {
                auto_now: false,
                auto_now_add: true
            }
        ));
    }

    #[test]
    fn test_defaults() {
        let field = FieldDef::integer().default(7);
        assert_eq!(field.initial_value(), FieldValue::Int(7));
        let uuid_field = FieldDef::uuid().default_with(DefaultValue::NewUuid);
        assert!(uuid_field.initial_value().as_uuid().is_some());
        assert_eq!(FieldDef::text().initial_value(), FieldValue::Null);
    }

    #[test]
    fn test_to_storage_reports_field_name() {
        let field = named(FieldDef::integer(), "age");
        match field.to_storage(&"old".into()) {
            Err(Error::Validation(errors)) => assert!(!errors.for_field("age").is_empty()),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_one_to_one_is_unique() {
        assert!(FieldDef::one_to_one("Profile").is_unique());
        assert!(!FieldDef::foreign_key("Author").is_unique());
    }
}
