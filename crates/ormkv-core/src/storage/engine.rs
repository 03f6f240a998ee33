//! Key-value storage backend over sled.

use async_trait::async_trait;
use ormkv_proto::{AggregateResult, Aggregation, Query, Row, TableRef, Value};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::{Db, Tree};
use tracing::{debug, info, instrument};

use super::config::KvConfig;
use super::key::{
    check_table_name, counter_key, index_meta_key, index_meta_prefix, row_prefix, table_meta_key,
    unique_table_prefix,
};
use super::record::StoredRow;
use super::schema::KvSchemaEditor;
use super::transaction::{assign_id, assign_ids, commit_ops, KvTransaction, WriteOp, WriteOutcome};
use crate::backend::{BackendTransaction, IndexMeta, StorageBackend, TableMeta};
use crate::error::Error;
use crate::migration::SchemaEditor;
use crate::query::{aggregate, executor, resolve_relations};

/// Name of the sled tree holding rows and metadata.
const DATA_TREE: &str = "ormkv";

struct KvState {
    db: Db,
    tree: Tree,
}

/// Storage backend keeping rows and metadata in one ordered sled tree.
///
/// The backend starts disconnected. Every data and schema operation fails
/// with [`Error::NotConnected`] until [`connect`](StorageBackend::connect)
/// succeeds.
pub struct KvBackend {
    name: String,
    config: KvConfig,
    state: RwLock<Option<KvState>>,
}

impl KvBackend {
    /// Create a disconnected backend.
    pub fn new(name: impl Into<String>, config: KvConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(None),
        }
    }

    /// Backend configuration.
    pub fn config(&self) -> &KvConfig {
        &self.config
    }

    /// Handle on the data tree; fails when disconnected.
    pub(crate) fn tree(&self) -> Result<Tree, Error> {
        self.state
            .read()
            .as_ref()
            .map(|state| state.tree.clone())
            .ok_or_else(|| Error::NotConnected(self.name.clone()))
    }

    /// Flush pending writes to disk.
    pub async fn flush(&self) -> Result<usize, Error> {
        let tree = self.tree()?;
        Ok(tree.flush_async().await?)
    }

    fn scan(&self, tree: &Tree, query: &Query) -> Result<Vec<Row>, Error> {
        check_table_name(&query.table.name)?;
        let meta: Option<TableMeta> = read_json(tree, &table_meta_key(&query.table.name))?;

        let hidden: Vec<String> = match &meta {
            Some(meta) if !query.include_deprecated => {
                if meta.deprecated {
                    debug!(table = %meta.name, "table is deprecated; returning no rows");
                    return Ok(Vec::new());
                }
                meta.deprecated_columns().map(str::to_string).collect()
            }
            _ => Vec::new(),
        };

        let mut rows = Vec::new();
        for entry in tree.scan_prefix(row_prefix(&query.table.name)) {
            let (_, bytes) = entry?;
            let mut row = StoredRow::from_bytes(&bytes)?.columns;
            for column in &hidden {
                row.remove(column);
            }
            rows.push(row);
        }

        executor::run(query, rows)
    }

    /// Keys of the rows a query matches.
    async fn matching_ids(&self, query: &Query) -> Result<Vec<Value>, Error> {
        let pk = query.table.primary_key.clone();
        let mut keys = query.clone();
        keys.projection = Some(vec![pk.clone()]);
        Ok(self
            .execute(&keys)
            .await?
            .into_iter()
            .filter_map(|mut row| row.remove(&pk))
            .collect())
    }
}

impl std::fmt::Debug for KvBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvBackend")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Read a JSON metadata entry.
pub(crate) fn read_json<T: DeserializeOwned>(tree: &Tree, key: &[u8]) -> Result<Option<T>, Error> {
    match tree.get(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| Error::Deserialization(e.to_string())),
        None => Ok(None),
    }
}

/// Write a JSON metadata entry.
pub(crate) fn write_json<T: Serialize>(tree: &Tree, key: &[u8], value: &T) -> Result<(), Error> {
    tree.insert(key, serde_json::to_vec(value)?)?;
    Ok(())
}

fn written(outcomes: Vec<WriteOutcome>) -> Vec<Row> {
    outcomes
        .into_iter()
        .filter_map(|outcome| match outcome {
            WriteOutcome::Written(row) => Some(row),
            WriteOutcome::Deleted(_) => None,
        })
        .collect()
}

fn single_row(outcomes: Vec<WriteOutcome>, operation: &str) -> Result<Row, Error> {
    written(outcomes)
        .pop()
        .ok_or_else(|| Error::Transaction(format!("{operation} produced no row")))
}

#[async_trait]
impl StorageBackend for KvBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.state.read().is_some()
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn connect(&self) -> Result<(), Error> {
        if self.is_connected() {
            return Ok(());
        }
        let db = self.config.to_sled_config().open()?;
        let tree = db.open_tree(DATA_TREE)?;
        let recovered = db.was_recovered();
        *self.state.write() = Some(KvState { db, tree });
        info!(path = %self.config.path.display(), recovered, "key-value backend connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        let state = self.state.write().take();
        if let Some(state) = state {
            state.db.flush_async().await?;
            info!(backend = %self.name, "key-value backend disconnected");
        }
        Ok(())
    }

    async fn execute(&self, query: &Query) -> Result<Vec<Row>, Error> {
        self.tree()?;
        query.validate()?;
        let query = resolve_relations(self, query).await?;
        let tree = self.tree()?;
        self.scan(&tree, &query)
    }

    async fn count(&self, query: &Query) -> Result<usize, Error> {
        let mut counted = query.clone();
        counted.projection = Some(vec![query.table.primary_key.clone()]);
        Ok(self.execute(&counted).await?.len())
    }

    async fn aggregate(
        &self,
        query: &Query,
        aggregations: &[Aggregation],
    ) -> Result<Vec<AggregateResult>, Error> {
        let rows = self.execute(query).await?;
        aggregate::compute(&rows, aggregations)
    }

    async fn insert(&self, table: &TableRef, mut row: Row) -> Result<Row, Error> {
        let tree = self.tree()?;
        check_table_name(&table.name)?;
        assign_id(&tree, table, &mut row)?;
        let outcomes = commit_ops(
            &tree,
            &[WriteOp::Insert {
                table: table.clone(),
                row,
            }],
        )?;
        single_row(outcomes, "insert")
    }

    async fn update(&self, table: &TableRef, id: &Value, changes: Row) -> Result<Row, Error> {
        let tree = self.tree()?;
        let outcomes = commit_ops(
            &tree,
            &[WriteOp::Update {
                table: table.clone(),
                id: id.clone(),
                changes,
            }],
        )?;
        single_row(outcomes, "update")
    }

    async fn delete(&self, table: &TableRef, id: &Value) -> Result<bool, Error> {
        let tree = self.tree()?;
        let outcomes = commit_ops(
            &tree,
            &[WriteOp::Delete {
                table: table.clone(),
                id: id.clone(),
            }],
        )?;
        Ok(matches!(outcomes.first(), Some(WriteOutcome::Deleted(true))))
    }

    #[instrument(skip(self, rows), fields(backend = %self.name, table = %table.name, rows = rows.len()))]
    async fn bulk_insert(&self, table: &TableRef, mut rows: Vec<Row>) -> Result<Vec<Row>, Error> {
        let tree = self.tree()?;
        check_table_name(&table.name)?;
        assign_ids(&tree, table, &mut rows)?;
        let ops: Vec<WriteOp> = rows
            .into_iter()
            .map(|row| WriteOp::Insert {
                table: table.clone(),
                row,
            })
            .collect();
        Ok(written(commit_ops(&tree, &ops)?))
    }

    async fn bulk_update(&self, table: &TableRef, rows: Vec<Row>) -> Result<usize, Error> {
        let tree = self.tree()?;
        let mut ops = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row
                .get(&table.primary_key)
                .filter(|id| !id.is_null())
                .cloned()
                .ok_or_else(|| {
                    Error::validation(table.primary_key.clone(), "bulk update rows need a key")
                })?;
            ops.push(WriteOp::Update {
                table: table.clone(),
                id,
                changes: row,
            });
        }
        Ok(commit_ops(&tree, &ops)?.len())
    }

    async fn update_many(&self, query: &Query, changes: Row) -> Result<usize, Error> {
        let ids = self.matching_ids(query).await?;
        let tree = self.tree()?;
        let ops: Vec<WriteOp> = ids
            .into_iter()
            .map(|id| WriteOp::Update {
                table: query.table.clone(),
                id,
                changes: changes.clone(),
            })
            .collect();
        let updated = commit_ops(&tree, &ops)?.len();
        debug!(table = %query.table.name, updated, "update_many committed");
        Ok(updated)
    }

    async fn delete_many(&self, query: &Query) -> Result<usize, Error> {
        let ids = self.matching_ids(query).await?;
        let tree = self.tree()?;
        let ops: Vec<WriteOp> = ids
            .into_iter()
            .map(|id| WriteOp::Delete {
                table: query.table.clone(),
                id,
            })
            .collect();
        let deleted = commit_ops(&tree, &ops)?
            .iter()
            .filter(|o| matches!(o, WriteOutcome::Deleted(true)))
            .count();
        debug!(table = %query.table.name, deleted, "delete_many committed");
        Ok(deleted)
    }

    async fn begin_transaction(&self) -> Result<Box<dyn BackendTransaction>, Error> {
        Ok(Box::new(KvTransaction::new(self.name.clone(), self.tree()?)))
    }

    fn schema_editor(&self) -> Result<Box<dyn SchemaEditor + '_>, Error> {
        Ok(Box::new(KvSchemaEditor::new(self, self.tree()?)))
    }

    async fn table_exists(&self, table: &str) -> Result<bool, Error> {
        let tree = self.tree()?;
        Ok(tree.contains_key(table_meta_key(table))?)
    }

    async fn create_table(&self, meta: &TableMeta) -> Result<(), Error> {
        let tree = self.tree()?;
        check_table_name(&meta.name)?;
        write_json(&tree, &table_meta_key(&meta.name), meta)?;
        debug!(table = %meta.name, columns = meta.columns.len(), "table metadata written");
        Ok(())
    }

    async fn table_meta(&self, table: &str) -> Result<Option<TableMeta>, Error> {
        let tree = self.tree()?;
        read_json(&tree, &table_meta_key(table))
    }

    #[instrument(skip(self), fields(backend = %self.name))]
    async fn drop_table(&self, table: &str) -> Result<usize, Error> {
        let tree = self.tree()?;
        check_table_name(table)?;

        let mut meta = sled::Batch::default();
        meta.remove(table_meta_key(table));
        meta.remove(counter_key(table));
        for prefix in [index_meta_prefix(table), unique_table_prefix(table)] {
            for entry in tree.scan_prefix(prefix) {
                let (key, _) = entry?;
                meta.remove(key);
            }
        }
        tree.apply_batch(meta)?;

        let prefix = row_prefix(table);
        let batch_size = self.config.drop_batch_size.max(1);
        let mut removed = 0;
        loop {
            let mut batch = sled::Batch::default();
            let mut n = 0;
            for entry in tree.scan_prefix(&prefix).take(batch_size) {
                let (key, _) = entry?;
                batch.remove(key);
                n += 1;
            }
            if n == 0 {
                break;
            }
            tree.apply_batch(batch)?;
            removed += n;
            debug!(table, batch = n, removed, "dropped row batch");
        }

        info!(table, removed, "table dropped");
        Ok(removed)
    }

    async fn create_index(&self, index: &IndexMeta) -> Result<(), Error> {
        let tree = self.tree()?;
        check_table_name(&index.table)?;
        write_json(&tree, &index_meta_key(&index.table, &index.name), index)
    }

    async fn drop_index(&self, table: &str, name: &str) -> Result<bool, Error> {
        let tree = self.tree()?;
        Ok(tree.remove(index_meta_key(table, name))?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormkv_proto::Filter;

    async fn backend() -> KvBackend {
        let backend = KvBackend::new("test", KvConfig::temporary());
        backend.connect().await.unwrap();
        backend
    }

    fn named(name: &str) -> Row {
        let mut row = Row::new();
        row.insert("name".into(), Value::Text(name.into()));
        row
    }

    #[tokio::test]
    async fn test_operations_fail_when_disconnected() {
        let backend = KvBackend::new("offline", KvConfig::temporary());
        let table = TableRef::new("people");
        assert!(matches!(
            backend.insert(&table, named("a")).await,
            Err(Error::NotConnected(name)) if name == "offline"
        ));
        assert!(matches!(
            backend.execute(&Query::new(table)).await,
            Err(Error::NotConnected(_))
        ));
        assert!(backend.schema_editor().is_err());

        backend.connect().await.unwrap();
        backend.connect().await.unwrap();
        assert!(backend.is_connected());
        backend.disconnect().await.unwrap();
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_insert_assigns_sequential_ids() {
        let backend = backend().await;
        let table = TableRef::new("people");
        let a = backend.insert(&table, named("a")).await.unwrap();
        let b = backend.insert(&table, named("b")).await.unwrap();
        assert_eq!(a["id"], Value::Int(1));
        assert_eq!(b["id"], Value::Int(2));

        let mut explicit = named("c");
        explicit.insert("id".into(), Value::Int(10));
        backend.insert(&table, explicit).await.unwrap();
        let d = backend.insert(&table, named("d")).await.unwrap();
        assert_eq!(d["id"], Value::Int(11));
    }

    #[tokio::test]
    async fn test_deprecated_table_and_columns_hidden() {
        let backend = backend().await;
        let table = TableRef::new("people");
        let mut row = named("a");
        row.insert("nickname".into(), Value::Text("x".into()));
        backend.insert(&table, row).await.unwrap();

        let mut meta = TableMeta::new("people", "id");
        meta.columns.push(crate::backend::ColumnMeta {
            name: "nickname".into(),
            kind: "CharField".into(),
            nullable: true,
            unique: false,
            default: None,
            deprecated: true,
        });
        backend.create_table(&meta).await.unwrap();

        let rows = backend.execute(&Query::new(table.clone())).await.unwrap();
        assert!(!rows[0].contains_key("nickname"));
        let rows = backend
            .execute(&Query::new(table.clone()).with_deprecated())
            .await
            .unwrap();
        assert!(rows[0].contains_key("nickname"));

        meta.deprecated = true;
        backend.create_table(&meta).await.unwrap();
        assert!(backend.execute(&Query::new(table)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete_many() {
        let backend = backend().await;
        let table = TableRef::new("people");
        backend
            .bulk_insert(&table, vec![named("a"), named("b"), named("a")])
            .await
            .unwrap();

        let mut changes = Row::new();
        changes.insert("name".into(), Value::Text("z".into()));
        let query = Query::new(table.clone()).with_filter(Filter::eq("name", "a"));
        assert_eq!(backend.update_many(&query, changes).await.unwrap(), 2);

        let zs = Query::new(table.clone()).with_filter(Filter::eq("name", "z"));
        assert_eq!(backend.count(&zs).await.unwrap(), 2);
        assert_eq!(backend.delete_many(&zs).await.unwrap(), 2);
        assert_eq!(backend.count(&Query::new(table)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_drop_table_in_batches() {
        let backend = KvBackend::new("test", KvConfig::temporary().with_drop_batch_size(3));
        backend.connect().await.unwrap();
        let table = TableRef::new("items").with_unique("name");
        let rows = (0..10).map(|i| named(&format!("item-{i}"))).collect();
        backend.bulk_insert(&table, rows).await.unwrap();
        backend.create_table(&TableMeta::new("items", "id")).await.unwrap();

        assert_eq!(backend.drop_table("items").await.unwrap(), 10);
        assert!(!backend.table_exists("items").await.unwrap());
        assert!(backend.execute(&Query::new(table.clone())).await.unwrap().is_empty());

        // Claims and the counter went with the table.
        let row = backend.insert(&table, named("item-0")).await.unwrap();
        assert_eq!(row["id"], Value::Int(1));
    }

    #[tokio::test]
    async fn test_raw_is_unsupported() {
        let backend = backend().await;
        assert!(matches!(backend.raw("SELECT 1").await, Err(Error::Unsupported(_))));
    }
}
