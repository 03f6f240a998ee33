//! Coercion between in-memory and storage representations.
//!
//! `coerce` maps an incoming value into the canonical in-memory form for a
//! kind. Storage conversion is only defined on canonical values, which is what
//! makes `from_storage(to_storage(v)) == v` hold for every coerced value.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use ormkv_proto::Value;
use uuid::Uuid;

use super::kind::FieldKind;
use super::value::FieldValue;

/// Coerce a non-null value into the kind's canonical in-memory form.
pub(crate) fn coerce(kind: &FieldKind, value: &FieldValue) -> Result<FieldValue, String> {
    match kind {
        FieldKind::Auto | FieldKind::BigInteger => coerce_int(value).map(FieldValue::Int),
        FieldKind::Integer => {
            let i = coerce_int(value)?;
            if i < i32::MIN as i64 || i > i32::MAX as i64 {
                return Err(format!("{i} is out of range for a 32-bit integer"));
            }
            Ok(FieldValue::Int(i))
        }
        FieldKind::Float => coerce_float(value).map(FieldValue::Float),
        FieldKind::Decimal {
            max_digits,
            decimal_places,
        } => coerce_decimal(value, *max_digits, *decimal_places).map(FieldValue::Decimal),
        FieldKind::Char { .. } | FieldKind::Email { .. } | FieldKind::Text => match value {
            FieldValue::Text(s) => Ok(FieldValue::Text(s.clone())),
            other => Err(format!("expected text, got {}", other.type_name())),
        },
        FieldKind::Boolean => match value {
            FieldValue::Bool(b) => Ok(FieldValue::Bool(*b)),
            FieldValue::Int(0) => Ok(FieldValue::Bool(false)),
            FieldValue::Int(1) => Ok(FieldValue::Bool(true)),
            FieldValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(FieldValue::Bool(true)),
                "false" | "0" => Ok(FieldValue::Bool(false)),
                _ => Err(format!("'{s}' is not a boolean")),
            },
            other => Err(format!("expected bool, got {}", other.type_name())),
        },
        FieldKind::Date => match value {
            FieldValue::Date(d) => Ok(FieldValue::Date(*d)),
            FieldValue::DateTime(dt) => Ok(FieldValue::Date(dt.date_naive())),
            FieldValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(FieldValue::Date)
                .map_err(|e| format!("'{s}' is not a date: {e}")),
            other => Err(format!("expected date, got {}", other.type_name())),
        },
        FieldKind::DateTime { .. } => {
            let dt = match value {
                FieldValue::DateTime(dt) => *dt,
                FieldValue::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                    .map(|d| d.with_timezone(&Utc))
                    .map_err(|e| format!("'{s}' is not an RFC 3339 timestamp: {e}"))?,
                other => return Err(format!("expected datetime, got {}", other.type_name())),
            };
            truncate_micros(dt).map(FieldValue::DateTime)
        }
        FieldKind::Uuid => match value {
            FieldValue::Uuid(u) => Ok(FieldValue::Uuid(*u)),
            FieldValue::Text(s) => Uuid::parse_str(s.trim())
                .map(FieldValue::Uuid)
                .map_err(|e| format!("'{s}' is not a UUID: {e}")),
            other => Err(format!("expected uuid, got {}", other.type_name())),
        },
        FieldKind::Json => Ok(FieldValue::Json(to_json(value))),
        FieldKind::ForeignKey(_) | FieldKind::OneToOne(_) => match value {
            FieldValue::Int(_) | FieldValue::Text(_) | FieldValue::Uuid(_) => Ok(value.clone()),
            other => Err(format!(
                "expected an identifier (int, text or uuid), got {}",
                other.type_name()
            )),
        },
        FieldKind::ManyToMany(_) => Err("many-to-many fields hold no value".to_string()),
    }
}

/// Convert a canonical in-memory value to its storage form.
pub(crate) fn to_storage(kind: &FieldKind, value: &FieldValue) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let value = coerce(kind, value)?;
    Ok(match value {
        FieldValue::Null => Value::Null,
        FieldValue::Bool(b) => Value::Bool(b),
        FieldValue::Int(i) => Value::Int(i),
        FieldValue::Float(f) => Value::Float(f),
        FieldValue::Decimal(d) => Value::Decimal(d),
        FieldValue::Text(s) => Value::Text(s),
        FieldValue::Date(d) => Value::Date(d.num_days_from_ce()),
        FieldValue::DateTime(dt) => Value::Timestamp(dt.timestamp_micros()),
        FieldValue::Uuid(u) => Value::Uuid(*u.as_bytes()),
        FieldValue::Json(j) => Value::Json(j.to_string()),
    })
}

/// Convert a storage value back to the in-memory form for a kind.
pub(crate) fn from_storage(kind: &FieldKind, raw: &Value) -> Result<FieldValue, String> {
    if raw.is_null() {
        return Ok(FieldValue::Null);
    }
    let value = match raw {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Bool(*b),
        Value::Int(i) => FieldValue::Int(*i),
        Value::Float(f) => FieldValue::Float(*f),
        Value::Decimal(d) => FieldValue::Decimal(d.clone()),
        Value::Text(s) => FieldValue::Text(s.clone()),
        Value::Date(days) => NaiveDate::from_num_days_from_ce_opt(*days)
            .map(FieldValue::Date)
            .ok_or_else(|| format!("day {days} is out of range"))?,
        Value::Timestamp(micros) => DateTime::from_timestamp_micros(*micros)
            .map(FieldValue::DateTime)
            .ok_or_else(|| format!("timestamp {micros} is out of range"))?,
        Value::Uuid(bytes) => FieldValue::Uuid(Uuid::from_bytes(*bytes)),
        Value::Json(text) => serde_json::from_str(text)
            .map(FieldValue::Json)
            .map_err(|e| format!("stored JSON is malformed: {e}"))?,
    };
    match kind {
        // Stored JSON strings must not be re-read as text by `coerce`.
        FieldKind::Json => Ok(value),
        _ => coerce(kind, &value),
    }
}

fn coerce_int(value: &FieldValue) -> Result<i64, String> {
    match value {
        FieldValue::Int(i) => Ok(*i),
        FieldValue::Float(f) if f.is_finite() && f.fract() == 0.0 => {
            if *f < i64::MIN as f64 || *f > i64::MAX as f64 {
                Err(format!("{f} is out of range for an integer"))
            } else {
                Ok(*f as i64)
            }
        }
        FieldValue::Float(f) => Err(format!("{f} is not an integer")),
        FieldValue::Text(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| format!("'{s}' is not an integer")),
        other => Err(format!("expected integer, got {}", other.type_name())),
    }
}

fn coerce_float(value: &FieldValue) -> Result<f64, String> {
    let f = match value {
        FieldValue::Float(f) => *f,
        FieldValue::Int(i) => *i as f64,
        FieldValue::Decimal(s) | FieldValue::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("'{s}' is not a number"))?,
        other => return Err(format!("expected float, got {}", other.type_name())),
    };
    if f.is_finite() {
        Ok(f)
    } else {
        Err(format!("{f} is not a finite number"))
    }
}

fn coerce_decimal(value: &FieldValue, max_digits: u32, places: u32) -> Result<String, String> {
    let text = match value {
        FieldValue::Decimal(s) | FieldValue::Text(s) => s.trim().to_string(),
        FieldValue::Int(i) => i.to_string(),
        FieldValue::Float(f) if f.is_finite() => format!("{:.*}", places as usize, f),
        other => return Err(format!("expected decimal, got {}", other.type_name())),
    };
    normalize_decimal(&text, max_digits, places)
}

/// Render a decimal string with exactly `places` fractional digits.
fn normalize_decimal(text: &str, max_digits: u32, places: u32) -> Result<String, String> {
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
    let digits_ok = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    if (int_part.is_empty() && frac_part.is_empty()) || !digits_ok(int_part) || !digits_ok(frac_part)
    {
        return Err(format!("'{text}' is not a decimal number"));
    }

    let frac_trimmed = frac_part.trim_end_matches('0');
    if frac_trimmed.len() > places as usize {
        return Err(format!(
            "'{text}' has more than {places} decimal places"
        ));
    }
    let int_trimmed = int_part.trim_start_matches('0');
    let int_digits = int_trimmed.len() as u32;
    if int_digits + places > max_digits {
        return Err(format!(
            "'{text}' has more than {max_digits} digits"
        ));
    }

    let int_out = if int_trimmed.is_empty() { "0" } else { int_trimmed };
    let is_zero = int_trimmed.is_empty() && frac_trimmed.is_empty();
    let sign = if negative && !is_zero { "-" } else { "" };
    if places == 0 {
        Ok(format!("{sign}{int_out}"))
    } else {
        let width = places as usize;
        Ok(format!("{sign}{int_out}.{frac_trimmed:0<width$}"))
    }
}

fn truncate_micros(dt: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    DateTime::from_timestamp_micros(dt.timestamp_micros())
        .ok_or_else(|| format!("{dt} is out of range"))
}

/// JSON form of a canonical value.
pub(crate) fn to_json(value: &FieldValue) -> serde_json::Value {
    use serde_json::Value as J;
    match value {
        FieldValue::Null => J::Null,
        FieldValue::Bool(b) => J::Bool(*b),
        FieldValue::Int(i) => J::from(*i),
        FieldValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(J::Number)
            .unwrap_or(J::Null),
        FieldValue::Decimal(s) | FieldValue::Text(s) => J::String(s.clone()),
        FieldValue::Date(d) => J::String(d.to_string()),
        FieldValue::DateTime(dt) => J::String(dt.to_rfc3339()),
        FieldValue::Uuid(u) => J::String(u.to_string()),
        FieldValue::Json(j) => j.clone(),
    }
}

/// Uncoerced value read back from JSON; pass it through [`coerce`] for a kind.
pub(crate) fn from_json(json: &serde_json::Value) -> FieldValue {
    use serde_json::Value as J;
    match json {
        J::Null => FieldValue::Null,
        J::Bool(b) => FieldValue::Bool(*b),
        J::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => FieldValue::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        J::String(s) => FieldValue::Text(s.clone()),
        other => FieldValue::Json(other.clone()),
    }
}
