//! Field kinds and relation descriptors.

use serde::{Deserialize, Serialize};

/// Target of a relation field.
///
/// Targets are written as `"Model"`, `"app.Model"` or `"self"`. The registry
/// qualifies the name when the owning model registers and marks the target
/// resolved once the target model is registered too.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RelationTarget {
    /// Target model not registered yet.
    Deferred(String),
    /// Target model registered under this qualified name.
    Resolved(String),
}

impl RelationTarget {
    /// The target name, qualified once the owning model has registered.
    pub fn name(&self) -> &str {
        match self {
            RelationTarget::Deferred(name) | RelationTarget::Resolved(name) => name,
        }
    }

    /// Whether the target model is registered.
    pub fn is_resolved(&self) -> bool {
        matches!(self, RelationTarget::Resolved(_))
    }
}

/// What happens to referencing rows when a target row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    /// Delete referencing rows.
    #[default]
    Cascade,
    /// Null out the foreign key.
    SetNull,
    /// Refuse the delete while references exist.
    Protect,
    /// Leave referencing rows untouched.
    DoNothing,
}

impl OnDelete {
    /// Snake-case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OnDelete::Cascade => "cascade",
            OnDelete::SetNull => "set_null",
            OnDelete::Protect => "protect",
            OnDelete::DoNothing => "do_nothing",
        }
    }
}

/// Relation details shared by foreign-key, one-to-one and many-to-many fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    /// Target model.
    pub target: RelationTarget,
    /// Name of the reverse accessor on the target model.
    pub related_name: Option<String>,
    /// Delete behaviour.
    pub on_delete: OnDelete,
    /// Link table for many-to-many relations.
    pub through: Option<String>,
}

impl Relation {
    /// Create a relation to a target written as `"Model"`, `"app.Model"` or `"self"`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: RelationTarget::Deferred(target.into()),
            related_name: None,
            on_delete: OnDelete::default(),
            through: None,
        }
    }
}

/// The kind of a field, which fixes its in-memory and storage domains.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Auto-incrementing integer primary key.
    Auto,
    /// 32-bit integer.
    Integer,
    /// 64-bit integer.
    BigInteger,
    /// Double precision float.
    Float,
    /// Fixed-point decimal.
    Decimal {
        /// Total significant digits.
        max_digits: u32,
        /// Digits after the decimal point.
        decimal_places: u32,
    },
    /// Bounded string.
    Char {
        /// Maximum length in characters.
        max_length: usize,
    },
    /// Bounded string holding an email address.
    Email {
        /// Maximum length in characters.
        max_length: usize,
    },
    /// Unbounded string.
    Text,
    /// Boolean.
    Boolean,
    /// Calendar date.
    Date,
    /// UTC timestamp.
    DateTime {
        /// Stamp the current time on every save.
        auto_now: bool,
        /// Stamp the current time on the first save only.
        auto_now_add: bool,
    },
    /// UUID.
    Uuid,
    /// JSON document.
    Json,
    /// Many-to-one relation stored as a foreign-key column.
    ForeignKey(Relation),
    /// One-to-one relation; a foreign key with an implied unique constraint.
    OneToOne(Relation),
    /// Many-to-many relation backed by a link table; no column of its own.
    ManyToMany(Relation),
}

impl FieldKind {
    /// Kind name recorded in migration state.
    pub fn name(&self) -> &'static str {
        match self {
            FieldKind::Auto => "AutoField",
            FieldKind::Integer => "IntegerField",
            FieldKind::BigInteger => "BigIntegerField",
            FieldKind::Float => "FloatField",
            FieldKind::Decimal { .. } => "DecimalField",
            FieldKind::Char { .. } => "CharField",
            FieldKind::Email { .. } => "EmailField",
            FieldKind::Text => "TextField",
            FieldKind::Boolean => "BooleanField",
            FieldKind::Date => "DateField",
            FieldKind::DateTime { .. } => "DateTimeField",
            FieldKind::Uuid => "UUIDField",
            FieldKind::Json => "JSONField",
            FieldKind::ForeignKey(_) => "ForeignKey",
            FieldKind::OneToOne(_) => "OneToOneField",
            FieldKind::ManyToMany(_) => "ManyToManyField",
        }
    }

    /// Whether the field stores a column on its own table.
    pub fn has_column(&self) -> bool {
        !matches!(self, FieldKind::ManyToMany(_))
    }

    /// Relation details, for relation kinds.
    pub fn relation(&self) -> Option<&Relation> {
        match self {
            FieldKind::ForeignKey(r) | FieldKind::OneToOne(r) | FieldKind::ManyToMany(r) => {
                Some(r)
            }
            _ => None,
        }
    }

    /// Mutable relation details, for relation kinds.
    pub fn relation_mut(&mut self) -> Option<&mut Relation> {
        match self {
            FieldKind::ForeignKey(r) | FieldKind::OneToOne(r) | FieldKind::ManyToMany(r) => {
                Some(r)
            }
            _ => None,
        }
    }

    /// Whether the field is a foreign key or one-to-one relation.
    pub fn is_foreign_key(&self) -> bool {
        matches!(self, FieldKind::ForeignKey(_) | FieldKind::OneToOne(_))
    }

    /// Whether values are textual.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            FieldKind::Char { .. } | FieldKind::Email { .. } | FieldKind::Text
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_and_columns() {
        assert_eq!(FieldKind::Char { max_length: 10 }.name(), "CharField");
        assert!(FieldKind::ForeignKey(Relation::new("Author")).has_column());
        assert!(!FieldKind::ManyToMany(Relation::new("Tag")).has_column());
        assert!(FieldKind::OneToOne(Relation::new("Profile")).is_foreign_key());
    }

    #[test]
    fn test_relation_target() {
        let target = RelationTarget::Deferred("blog.Author".into());
        assert_eq!(target.name(), "blog.Author");
        assert!(!target.is_resolved());
        assert!(RelationTarget::Resolved("blog.Author".into()).is_resolved());
    }
}
