//! Storage values.
//!
//! [`Value`] is the representation fields convert to before anything reaches a
//! backend. Filter predicates, ordering, and unique-constraint normalisation are
//! all defined over this type, so a backend and an in-memory evaluator that
//! both work on `Value`s agree by construction.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use rkyv::{Archive, Deserialize, Serialize};

/// A row of storage values keyed by column name.
pub type Row = BTreeMap<String, Value>;

/// A value as stored by a backend.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Value {
    /// Null value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating point.
    Float(f64),
    /// Fixed-point decimal in canonical text form (`-12.50`).
    Decimal(String),
    /// UTF-8 string.
    Text(String),
    /// Timestamp as microseconds since Unix epoch.
    Timestamp(i64),
    /// Calendar date as days since 0001-01-01 (day 1).
    Date(i32),
    /// UUID as 16 bytes.
    Uuid([u8; 16]),
    /// Serialized JSON document.
    Json(String),
}

impl Value {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Try to get as bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get as i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get as f64, widening integers and parsing decimals.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            Value::Decimal(d) => d.parse().ok(),
            _ => None,
        }
    }

    /// Try to get as string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the type name of this value.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Date(_) => "date",
            Value::Uuid(_) => "uuid",
            Value::Json(_) => "json",
        }
    }

    /// Case-normalised form used for uniqueness checks.
    ///
    /// Strings are trimmed and lowercased; every other value is unchanged.
    pub fn normalized(&self) -> Value {
        match self {
            Value::Text(s) => Value::Text(s.trim().to_lowercase()),
            other => other.clone(),
        }
    }

    /// Byte encoding of the normalised value, suitable as a key segment.
    ///
    /// Two values that compare equal after [`Value::normalized`] produce the
    /// same bytes. Integers and floats holding the same number share a key.
    pub fn unique_key_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self.normalized() {
            Value::Null => out.push(0),
            Value::Bool(b) => {
                out.push(1);
                out.push(b as u8);
            }
            Value::Int(i) => {
                out.push(2);
                out.extend_from_slice(&i.to_be_bytes());
            }
            Value::Float(f) if f.fract() == 0.0 && f.abs() < 9.0e15 => {
                out.push(2);
                out.extend_from_slice(&(f as i64).to_be_bytes());
            }
            Value::Float(f) => {
                out.push(9);
                out.extend_from_slice(&f.to_be_bytes());
            }
            Value::Decimal(d) => {
                out.push(3);
                out.extend_from_slice(d.as_bytes());
            }
            Value::Text(s) => {
                out.push(4);
                out.extend_from_slice(s.as_bytes());
            }
            Value::Timestamp(t) => {
                out.push(5);
                out.extend_from_slice(&t.to_be_bytes());
            }
            Value::Date(d) => {
                out.push(6);
                out.extend_from_slice(&d.to_be_bytes());
            }
            Value::Uuid(u) => {
                out.push(7);
                out.extend_from_slice(&u);
            }
            Value::Json(j) => {
                out.push(8);
                out.extend_from_slice(j.as_bytes());
            }
        }
        out
    }

    /// Compare two values of compatible types.
    ///
    /// Returns `None` when the values are not comparable (different types,
    /// nulls, or NaN). Integers, floats and decimals compare numerically.
    pub fn partial_compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, _) | (_, Value::Null) => None,
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => compare_decimal_text(a, b),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::Uuid(a), Value::Uuid(b)) => Some(a.cmp(b)),
            (Value::Json(a), Value::Json(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => None,
            },
        }
    }

    /// Equality used by filter predicates.
    ///
    /// Numbers compare across integer, float and decimal representations.
    pub fn loosely_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            _ => match self.partial_compare(other) {
                Some(ord) => ord == Ordering::Equal,
                None => self == other,
            },
        }
    }

    /// Total ordering used for sorting rows.
    ///
    /// Nulls sort first; values of different types sort by type rank so the
    /// result is deterministic even for mixed columns.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match self.partial_compare(other) {
            Some(ord) => ord,
            None => {
                let rank = self.sort_rank().cmp(&other.sort_rank());
                if rank != Ordering::Equal {
                    return rank;
                }
                match (self, other) {
                    (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
                    _ => Ordering::Equal,
                }
            }
        }
    }

    fn sort_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) | Value::Decimal(_) => 2,
            Value::Text(_) => 3,
            Value::Timestamp(_) => 4,
            Value::Date(_) => 5,
            Value::Uuid(_) => 6,
            Value::Json(_) => 7,
        }
    }
}

/// Compare two canonical decimal strings without going through floats.
fn compare_decimal_text(a: &str, b: &str) -> Option<Ordering> {
    let (a_neg, a_int, a_frac) = split_decimal(a)?;
    let (b_neg, b_int, b_frac) = split_decimal(b)?;

    let a_zero = is_zero(a_int, a_frac);
    let b_zero = is_zero(b_int, b_frac);
    let a_neg = a_neg && !a_zero;
    let b_neg = b_neg && !b_zero;

    if a_neg != b_neg {
        return Some(if a_neg { Ordering::Less } else { Ordering::Greater });
    }

    let magnitude = a_int
        .len()
        .cmp(&b_int.len())
        .then_with(|| a_int.cmp(b_int))
        .then_with(|| {
            let width = a_frac.len().max(b_frac.len());
            let pa = format!("{a_frac:0<width$}");
            let pb = format!("{b_frac:0<width$}");
            pa.cmp(&pb)
        });

    Some(if a_neg { magnitude.reverse() } else { magnitude })
}

fn split_decimal(s: &str) -> Option<(bool, &str, &str)> {
    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (int, frac) = match body.split_once('.') {
        Some((i, f)) => (i, f),
        None => (body, ""),
    };
    if int.is_empty() && frac.is_empty() {
        return None;
    }
    if !int.bytes().all(|b| b.is_ascii_digit()) || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let int = int.trim_start_matches('0');
    let frac = frac.trim_end_matches('0');
    Some((neg, int, frac))
}

fn is_zero(int: &str, frac: &str) -> bool {
    int.is_empty() && frac.is_empty()
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}
