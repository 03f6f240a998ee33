//! Filter evaluation for query execution.
//!
//! [`FilterEvaluator`] decides local filter clauses against a storage row.
//! The key-value backend and in-memory refinement of fetched querysets both
//! go through it, so the two paths always agree.

use ormkv_proto::{Filter, Lookup, Row, Value};

use crate::error::Error;

/// Evaluates compiled filter clauses against rows.
pub struct FilterEvaluator;

impl FilterEvaluator {
    /// Whether a row satisfies every clause.
    pub fn matches_all(filters: &[Filter], row: &Row) -> Result<bool, Error> {
        for filter in filters {
            if !Self::evaluate(filter, row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Evaluate one clause. Clauses with relation hops cannot be decided
    /// from a single row and are rejected.
    pub fn evaluate(filter: &Filter, row: &Row) -> Result<bool, Error> {
        if !filter.is_local() {
            return Err(Error::InvalidLookup(format!(
                "clause on '{}' crosses {} relation(s) and must be resolved first",
                filter.column,
                filter.hops.len()
            )));
        }

        let field = row.get(&filter.column).unwrap_or(&Value::Null);
        let matched = match filter.lookup {
            Lookup::In | Lookup::NotIn => {
                let found = filter
                    .operand
                    .as_list()
                    .iter()
                    .any(|v| field.loosely_equals(v));
                found == (filter.lookup == Lookup::In)
            }
            lookup => {
                let operand = filter.operand.as_single().ok_or_else(|| {
                    Error::InvalidLookup(format!(
                        "lookup '{}' on '{}' takes a single value",
                        lookup, filter.column
                    ))
                })?;
                Self::compare(lookup, field, operand)
            }
        };

        Ok(matched != filter.negated)
    }

    fn compare(lookup: Lookup, field: &Value, operand: &Value) -> bool {
        match lookup {
            Lookup::Exact => Self::values_equal(field, operand),
            Lookup::Ne => !Self::values_equal(field, operand),
            Lookup::IsNull => field.is_null() == operand.as_bool().unwrap_or(true),
            Lookup::Gt => Self::ordered(field, operand, |o| o.is_gt()),
            Lookup::Gte => Self::ordered(field, operand, |o| o.is_ge()),
            Lookup::Lt => Self::ordered(field, operand, |o| o.is_lt()),
            Lookup::Lte => Self::ordered(field, operand, |o| o.is_le()),
            Lookup::IExact if operand.is_null() => field.is_null(),
            textual => match (field.as_str(), operand.as_str()) {
                (Some(value), Some(pattern)) => Self::text_match(textual, value, pattern),
                _ => false,
            },
        }
    }

    /// Equality where a null operand means "is null".
    fn values_equal(field: &Value, operand: &Value) -> bool {
        if operand.is_null() {
            return field.is_null();
        }
        field.loosely_equals(operand)
    }

    fn ordered(field: &Value, operand: &Value, test: impl FnOnce(std::cmp::Ordering) -> bool) -> bool {
        field.partial_compare(operand).map(test).unwrap_or(false)
    }

    fn text_match(lookup: Lookup, value: &str, pattern: &str) -> bool {
        match lookup {
            Lookup::Contains => value.contains(pattern),
            Lookup::StartsWith => value.starts_with(pattern),
            Lookup::EndsWith => value.ends_with(pattern),
            Lookup::IExact => value.to_lowercase() == pattern.to_lowercase(),
            Lookup::IContains => value.to_lowercase().contains(&pattern.to_lowercase()),
            Lookup::IStartsWith => value.to_lowercase().starts_with(&pattern.to_lowercase()),
            _ => false,
        }
    }
}
