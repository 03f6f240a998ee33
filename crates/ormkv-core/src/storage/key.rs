//! Key layout.
//!
//! Every key lives in one sled tree and is made of segments joined by `0x00`:
//!
//! | Key | Value |
//! |-----|-------|
//! | `table \0 id` | rkyv [`StoredRow`](super::record::StoredRow) |
//! | `_meta \0 tables \0 table` | JSON table metadata |
//! | `_meta \0 indexes \0 table \0 name` | JSON index metadata |
//! | `_meta \0 counters \0 table` | big-endian `i64` counter |
//! | `_meta \0 unique \0 table \0 column \0 value` | owning row id |
//! | `_meta \0 migrations \0 app \0 name` | JSON applied-migration record |
//!
//! Ids are encoded so that byte order matches value order, so a prefix scan
//! returns rows in ascending key order.

use std::time::{SystemTime, UNIX_EPOCH};

use ormkv_proto::Value;

use crate::error::Error;

/// Segment separator.
pub const SEP: u8 = 0;

/// First segment of every metadata key.
pub const META: &[u8] = b"_meta";

const ID_INT: u8 = 1;
const ID_TEXT: u8 = 2;
const ID_UUID: u8 = 3;

fn join(segments: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(segments.iter().map(|s| s.len() + 1).sum());
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            key.push(SEP);
        }
        key.extend_from_slice(segment);
    }
    key
}

/// Reject table names that would break the key layout.
pub fn check_table_name(table: &str) -> Result<(), Error> {
    if table.is_empty() || table.as_bytes().contains(&SEP) || table.as_bytes() == META {
        return Err(Error::InvalidData(format!("invalid table name '{table}'")));
    }
    Ok(())
}

/// Encode a row id. Only integers, text and UUIDs may be keys.
pub fn encode_id(id: &Value) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    match id {
        Value::Int(i) => {
            out.push(ID_INT);
            out.extend_from_slice(&((*i as u64) ^ (1 << 63)).to_be_bytes());
        }
        Value::Text(s) => {
            out.push(ID_TEXT);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Uuid(u) => {
            out.push(ID_UUID);
            out.extend_from_slice(u);
        }
        other => {
            return Err(Error::InvalidData(format!(
                "{} values cannot be primary keys",
                other.type_name()
            )))
        }
    }
    Ok(out)
}

/// Decode a row id produced by [`encode_id`].
pub fn decode_id(bytes: &[u8]) -> Result<Value, Error> {
    match bytes.split_first() {
        Some((&ID_INT, rest)) if rest.len() == 8 => {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(rest);
            Ok(Value::Int((u64::from_be_bytes(buf) ^ (1 << 63)) as i64))
        }
        Some((&ID_TEXT, rest)) => String::from_utf8(rest.to_vec())
            .map(Value::Text)
            .map_err(|e| Error::Deserialization(e.to_string())),
        Some((&ID_UUID, rest)) if rest.len() == 16 => {
            let mut buf = [0u8; 16];
            buf.copy_from_slice(rest);
            Ok(Value::Uuid(buf))
        }
        _ => Err(Error::Deserialization("malformed row id".into())),
    }
}

/// Prefix of every row of a table.
pub fn row_prefix(table: &str) -> Vec<u8> {
    let mut key = table.as_bytes().to_vec();
    key.push(SEP);
    key
}

/// Key of one row.
pub fn row_key(table: &str, id: &Value) -> Result<Vec<u8>, Error> {
    Ok(join(&[table.as_bytes(), &encode_id(id)?]))
}

/// Table metadata key.
pub fn table_meta_key(table: &str) -> Vec<u8> {
    join(&[META, b"tables", table.as_bytes()])
}

/// Prefix of all table metadata keys.
pub fn table_meta_prefix() -> Vec<u8> {
    let mut key = join(&[META, b"tables"]);
    key.push(SEP);
    key
}

/// Index metadata key.
pub fn index_meta_key(table: &str, name: &str) -> Vec<u8> {
    join(&[META, b"indexes", table.as_bytes(), name.as_bytes()])
}

/// Prefix of a table's index metadata keys.
pub fn index_meta_prefix(table: &str) -> Vec<u8> {
    let mut key = join(&[META, b"indexes", table.as_bytes()]);
    key.push(SEP);
    key
}

/// Id counter key.
pub fn counter_key(table: &str) -> Vec<u8> {
    join(&[META, b"counters", table.as_bytes()])
}

/// Unique claim key for a normalised value.
pub fn unique_key(table: &str, column: &str, value: &Value) -> Vec<u8> {
    join(&[
        META,
        b"unique",
        table.as_bytes(),
        column.as_bytes(),
        &value.unique_key_bytes(),
    ])
}

/// Prefix of a column's unique claims.
pub fn unique_column_prefix(table: &str, column: &str) -> Vec<u8> {
    let mut key = join(&[META, b"unique", table.as_bytes(), column.as_bytes()]);
    key.push(SEP);
    key
}

/// Prefix of all unique claims of a table.
pub fn unique_table_prefix(table: &str) -> Vec<u8> {
    let mut key = join(&[META, b"unique", table.as_bytes()]);
    key.push(SEP);
    key
}

/// Applied-migration key.
pub fn migration_key(app: &str, name: &str) -> Vec<u8> {
    join(&[META, b"migrations", app.as_bytes(), name.as_bytes()])
}

/// Prefix of all applied-migration keys.
pub fn migration_prefix() -> Vec<u8> {
    let mut key = join(&[META, b"migrations"]);
    key.push(SEP);
    key
}

/// Get the current timestamp in microseconds since Unix epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_ids_sort_numerically() {
        let ids = [-5i64, -1, 0, 1, 2, 10, 300, i64::MAX];
        let encoded: Vec<Vec<u8>> = ids
            .iter()
            .map(|i| encode_id(&Value::Int(*i)).unwrap())
            .collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn test_id_roundtrip() {
        for id in [Value::Int(-42), Value::Text("sku-1".into()), Value::Uuid([7; 16])] {
            assert_eq!(decode_id(&encode_id(&id).unwrap()).unwrap(), id);
        }
        assert!(encode_id(&Value::Float(1.0)).is_err());
        assert!(decode_id(&[9, 9]).is_err());
    }

    #[test]
    fn test_row_keys_stay_under_table_prefix() {
        let key = row_key("blog_post", &Value::Int(1)).unwrap();
        assert!(key.starts_with(&row_prefix("blog_post")));
        assert!(!key.starts_with(&row_prefix("blog")));
    }

    #[test]
    fn test_meta_keys_do_not_collide_with_rows() {
        assert!(check_table_name("_meta").is_err());
        assert!(check_table_name("bad\0name").is_err());
        assert!(check_table_name("blog_post").is_ok());
        assert!(table_meta_key("t").starts_with(&table_meta_prefix()));
        assert!(unique_key("t", "email", &Value::Text("A".into()))
            .starts_with(&unique_column_prefix("t", "email")));
        assert!(unique_column_prefix("t", "email").starts_with(&unique_table_prefix("t")));
    }

    #[test]
    fn test_unique_key_case_insensitive() {
        assert_eq!(
            unique_key("t", "email", &Value::Text("a@x.com".into())),
            unique_key("t", "email", &Value::Text("A@X.COM".into()))
        );
    }
}
