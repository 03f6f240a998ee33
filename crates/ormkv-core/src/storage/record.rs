//! Stored row encoding.

use ormkv_proto::Row;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::Error;

/// A row as persisted, with write timestamps.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct StoredRow {
    /// Column values.
    pub columns: Row,

    /// Creation timestamp in microseconds since Unix epoch.
    pub created_at: u64,

    /// Last write timestamp in microseconds since Unix epoch.
    pub updated_at: u64,
}

impl StoredRow {
    /// Create a row stamped with the current time.
    pub fn new(columns: Row) -> Self {
        let now = super::key::current_timestamp();
        Self {
            columns,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the columns, keeping the creation time.
    pub fn rewrite(&self, columns: Row) -> Self {
        Self {
            columns,
            created_at: self.created_at,
            updated_at: super::key::current_timestamp(),
        }
    }

    /// Serialize the row to bytes using rkyv.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a row from bytes using rkyv.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormkv_proto::Value;

    #[test]
    fn test_roundtrip_and_rewrite() {
        let mut columns = Row::new();
        columns.insert("id".into(), Value::Int(1));
        columns.insert("name".into(), Value::Text("Alice".into()));
        let row = StoredRow::new(columns.clone());

        let back = StoredRow::from_bytes(&row.to_bytes().unwrap()).unwrap();
        assert_eq!(back, row);

        columns.insert("name".into(), Value::Text("Alicia".into()));
        let rewritten = row.rewrite(columns);
        assert_eq!(rewritten.created_at, row.created_at);
        assert!(rewritten.updated_at >= row.updated_at);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(StoredRow::from_bytes(&[1, 2, 3]).is_err());
    }
}
