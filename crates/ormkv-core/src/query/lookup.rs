//! Filter path compilation.
//!
//! A path such as `post__author__name__icontains` is split on `__`. Leading
//! segments walk foreign keys, the next names the field tested, and an
//! optional final segment names the lookup (`exact` when omitted). Operands
//! are converted to storage values by the field they are compared with.

use chrono::{DateTime, NaiveDate, Utc};
use ormkv_proto::{Filter, Lookup, Operand, RelationHop, Value};
use uuid::Uuid;

use crate::error::Error;
use crate::field::{FieldDef, FieldValue};
use crate::model::{ModelDef, ModelRegistry};

/// Separator between path segments.
pub const LOOKUP_SEP: &str = "__";

/// Right-hand side of a filter as written by callers.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupValue {
    /// A single value.
    One(FieldValue),
    /// A list, for `in` / `not_in`.
    Many(Vec<FieldValue>),
}

macro_rules! impl_lookup_value {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for LookupValue {
                fn from(v: $ty) -> Self {
                    LookupValue::One(v.into())
                }
            }

            impl From<Vec<$ty>> for LookupValue {
                fn from(vs: Vec<$ty>) -> Self {
                    LookupValue::Many(vs.into_iter().map(Into::into).collect())
                }
            }
        )*
    };
}

impl_lookup_value!(
    FieldValue,
    bool,
    i32,
    i64,
    u32,
    f64,
    String,
    NaiveDate,
    DateTime<Utc>,
    Uuid,
    serde_json::Value,
);

impl From<&str> for LookupValue {
    fn from(v: &str) -> Self {
        LookupValue::One(v.into())
    }
}

impl From<Vec<&str>> for LookupValue {
    fn from(vs: Vec<&str>) -> Self {
        LookupValue::Many(vs.into_iter().map(Into::into).collect())
    }
}

impl<const N: usize> From<[&str; N]> for LookupValue {
    fn from(vs: [&str; N]) -> Self {
        LookupValue::Many(vs.into_iter().map(Into::into).collect())
    }
}

impl<const N: usize> From<[i64; N]> for LookupValue {
    fn from(vs: [i64; N]) -> Self {
        LookupValue::Many(vs.into_iter().map(Into::into).collect())
    }
}

/// Split a path into field segments and a lookup.
fn split_path(path: &str) -> (Vec<&str>, Lookup) {
    let mut segments: Vec<&str> = path.split(LOOKUP_SEP).collect();
    if segments.len() > 1 {
        if let Some(lookup) = segments.last().and_then(|s| Lookup::parse(s)) {
            segments.pop();
            return (segments, lookup);
        }
    }
    (segments, Lookup::Exact)
}

fn find_field<'m>(model: &'m ModelDef, segment: &str) -> Result<&'m FieldDef, Error> {
    model
        .field(segment)
        .or_else(|| model.field_by_column(segment))
        .ok_or_else(|| {
            Error::InvalidLookup(format!("{} has no field '{}'", model.name, segment))
        })
}

/// Compile one filter path against a model.
pub fn compile(
    registry: &ModelRegistry,
    model: &ModelDef,
    path: &str,
    value: &LookupValue,
    negated: bool,
) -> Result<Filter, Error> {
    let (segments, lookup) = split_path(path);
    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::InvalidLookup(format!("malformed filter path '{path}'")));
    }

    let mut hops = Vec::new();
    let mut current = std::sync::Arc::new(model.clone());
    let (last, walk) = segments
        .split_last()
        .ok_or_else(|| Error::InvalidLookup("empty filter path".into()))?;

    for segment in walk {
        let field = find_field(&current, segment)?;
        if !field.kind.is_foreign_key() {
            return Err(Error::InvalidLookup(format!(
                "'{}' in '{}' is not a foreign key of {}",
                segment, path, current.name
            )));
        }
        let target = registry.related_model(&current, &field.name)?;
        target.ensure_concrete()?;
        hops.push(RelationHop {
            column: field.column(),
            target: target.table_ref(),
        });
        current = target;
    }

    let field = find_field(&current, last)?;
    if !field.has_column() {
        return Err(Error::InvalidLookup(format!(
            "many-to-many field '{}' cannot be filtered directly",
            field.name
        )));
    }

    // Foreign keys compare against the target's key.
    let comparator = if field.kind.is_foreign_key() {
        registry
            .related_model(&current, &field.name)
            .ok()
            .filter(|target| !target.is_abstract)
            .map(|target| target.pk_field().clone())
            .unwrap_or_else(|| field.clone())
    } else {
        field.clone()
    };

    let operand = convert_operand(&comparator, lookup, value)?;
    let mut filter = Filter::new(field.column(), lookup, operand).through(hops);
    filter.negated = negated;
    Ok(filter)
}

fn convert_operand(field: &FieldDef, lookup: Lookup, value: &LookupValue) -> Result<Operand, Error> {
    match lookup {
        Lookup::IsNull => match value {
            LookupValue::One(FieldValue::Bool(b)) => Ok(Operand::Single(Value::Bool(*b))),
            _ => Err(Error::InvalidLookup(format!(
                "'{}__isnull' takes a boolean",
                field.name
            ))),
        },
        Lookup::In | Lookup::NotIn => {
            let items: &[FieldValue] = match value {
                LookupValue::Many(items) => items,
                LookupValue::One(item) => std::slice::from_ref(item),
            };
            items
                .iter()
                .map(|item| convert_single(field, lookup, item))
                .collect::<Result<Vec<_>, _>>()
                .map(Operand::List)
        }
        _ => match value {
            LookupValue::One(item) => convert_single(field, lookup, item).map(Operand::Single),
            LookupValue::Many(_) => Err(Error::InvalidLookup(format!(
                "lookup '{}' on '{}' takes a single value",
                lookup, field.name
            ))),
        },
    }
}

fn convert_single(field: &FieldDef, lookup: Lookup, value: &FieldValue) -> Result<Value, Error> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if lookup.is_textual() {
        return Ok(Value::Text(match value {
            FieldValue::Text(s) => s.clone(),
            other => other.to_string(),
        }));
    }
    field.to_storage(&field.clean(value)?)
}
