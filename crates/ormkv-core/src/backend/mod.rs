//! Storage backend interface.
//!
//! A [`StorageBackend`] executes compiled [`Query`] values and row-level
//! writes against a concrete store. Models and querysets never talk to a
//! store directly; they pick a backend by name from [`Connections`].
//!
//! | Concern | Methods |
//! |---------|---------|
//! | Lifecycle | `connect`, `disconnect`, `is_connected` |
//! | Reads | `execute`, `count`, `aggregate` |
//! | Writes | `insert`, `update`, `delete`, `bulk_insert`, `bulk_update`, `update_many`, `delete_many` |
//! | Transactions | `begin_transaction` |
//! | Schema | `schema_editor`, `table_exists`, `create_table`, `drop_table`, `create_index`, `drop_index` |

pub mod connections;
pub mod settings;

use async_trait::async_trait;
use ormkv_proto::{AggregateResult, Aggregation, Query, Row, TableRef, Value};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::migration::SchemaEditor;

pub use connections::Connections;
pub use settings::{BackendSettings, Engine, EnvSettings, JsonFileSettings, Settings, SettingsProvider};

/// Column description kept in table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMeta {
    /// Column name.
    pub name: String,
    /// Field kind name.
    pub kind: String,
    /// Whether nulls are allowed.
    pub nullable: bool,
    /// Whether values are unique.
    pub unique: bool,
    /// Default applied when backfilling, as JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    /// Deprecated columns are kept but hidden from query results.
    #[serde(default)]
    pub deprecated: bool,
}

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    /// Table name.
    pub name: String,
    /// Qualified name of the model owning the table, if any.
    #[serde(default)]
    pub model: Option<String>,
    /// Primary key column.
    pub primary_key: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnMeta>,
    /// Deprecated tables are kept but return no rows.
    #[serde(default)]
    pub deprecated: bool,
}

impl TableMeta {
    /// Create metadata with no columns.
    pub fn new(name: impl Into<String>, primary_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: None,
            primary_key: primary_key.into(),
            columns: Vec::new(),
            deprecated: false,
        }
    }

    /// Look up a column.
    pub fn column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Look up a column mutably.
    pub fn column_mut(&mut self, name: &str) -> Option<&mut ColumnMeta> {
        self.columns.iter_mut().find(|c| c.name == name)
    }

    /// Names of deprecated columns.
    pub fn deprecated_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.deprecated)
            .map(|c| c.name.as_str())
    }
}

/// Secondary index metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    /// Table the index belongs to.
    pub table: String,
    /// Index name.
    pub name: String,
    /// Indexed columns.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

/// A queued set of writes committed atomically.
///
/// `commit` and `rollback` consume the transaction, so a finished transaction
/// cannot be reused.
#[async_trait]
pub trait BackendTransaction: Send {
    /// Queue an upsert. Rows without a key on auto-increment tables get one
    /// allocated now; the key is returned.
    async fn set(&mut self, table: &TableRef, row: Row) -> Result<Value, Error>;

    /// Queue a delete.
    fn delete(&mut self, table: &TableRef, id: Value) -> Result<(), Error>;

    /// Number of queued operations.
    fn pending(&self) -> usize;

    /// Apply every queued operation in one atomic commit.
    async fn commit(self: Box<Self>) -> Result<usize, Error>;

    /// Discard the queue without touching the store.
    async fn rollback(self: Box<Self>) -> Result<(), Error>;
}

/// A store that executes compiled queries and row writes.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name, as registered in [`Connections`].
    fn name(&self) -> &str;

    /// Whether `connect` has succeeded and `disconnect` has not been called since.
    fn is_connected(&self) -> bool;

    /// Open the underlying store.
    async fn connect(&self) -> Result<(), Error>;

    /// Close the underlying store.
    async fn disconnect(&self) -> Result<(), Error>;

    /// Run a query, returning matching rows.
    async fn execute(&self, query: &Query) -> Result<Vec<Row>, Error>;

    /// Number of rows a query returns.
    async fn count(&self, query: &Query) -> Result<usize, Error>;

    /// Aggregate over the rows a query returns.
    async fn aggregate(
        &self,
        query: &Query,
        aggregations: &[Aggregation],
    ) -> Result<Vec<AggregateResult>, Error>;

    /// Insert a row, allocating a key when needed. Returns the stored row.
    async fn insert(&self, table: &TableRef, row: Row) -> Result<Row, Error>;

    /// Merge `changes` into the row with key `id`. Returns the stored row.
    async fn update(&self, table: &TableRef, id: &Value, changes: Row) -> Result<Row, Error>;

    /// Delete a row. Returns whether it existed.
    async fn delete(&self, table: &TableRef, id: &Value) -> Result<bool, Error>;

    /// Insert rows in one atomic commit.
    async fn bulk_insert(&self, table: &TableRef, rows: Vec<Row>) -> Result<Vec<Row>, Error>;

    /// Update rows (each carrying its key) in one atomic commit.
    async fn bulk_update(&self, table: &TableRef, rows: Vec<Row>) -> Result<usize, Error>;

    /// Apply `changes` to every row a query matches, atomically.
    async fn update_many(&self, query: &Query, changes: Row) -> Result<usize, Error>;

    /// Delete every row a query matches, atomically.
    async fn delete_many(&self, query: &Query) -> Result<usize, Error>;

    /// Start a transaction.
    async fn begin_transaction(&self) -> Result<Box<dyn BackendTransaction>, Error>;

    /// Schema editor applying migration operations to this backend.
    fn schema_editor(&self) -> Result<Box<dyn SchemaEditor + '_>, Error>;

    /// Whether table metadata exists.
    async fn table_exists(&self, table: &str) -> Result<bool, Error>;

    /// Record table metadata.
    async fn create_table(&self, meta: &TableMeta) -> Result<(), Error>;

    /// Read table metadata.
    async fn table_meta(&self, table: &str) -> Result<Option<TableMeta>, Error>;

    /// Remove table metadata and every row. Returns the number of rows removed.
    async fn drop_table(&self, table: &str) -> Result<usize, Error>;

    /// Record index metadata.
    async fn create_index(&self, index: &IndexMeta) -> Result<(), Error>;

    /// Remove index metadata. Returns whether it existed.
    async fn drop_index(&self, table: &str, name: &str) -> Result<bool, Error>;

    /// Run a backend-native statement.
    async fn raw(&self, statement: &str) -> Result<Vec<Row>, Error> {
        Err(Error::Unsupported(format!(
            "backend '{}' does not run raw statements ({} bytes given)",
            self.name(),
            statement.len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_meta_json_roundtrip() {
        let mut meta = TableMeta::new("blog_post", "id");
        meta.columns.push(ColumnMeta {
            name: "title".into(),
            kind: "CharField".into(),
            nullable: false,
            unique: false,
            default: None,
            deprecated: true,
        });
        let json = serde_json::to_string(&meta).unwrap();
        let back: TableMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
        assert_eq!(back.deprecated_columns().collect::<Vec<_>>(), vec!["title"]);
    }
}
