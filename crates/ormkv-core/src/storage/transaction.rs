//! Atomic write batches.
//!
//! Every write the key-value backend performs, single-row or bulk, is a list
//! of [`WriteOp`]s applied by [`commit_ops`] inside one sled transaction
//! together with the unique claims it implies.

use async_trait::async_trait;
use ormkv_proto::{Row, TableRef, Value};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Tree;
use tracing::debug;

use super::key::{check_table_name, encode_id, row_key};
use super::record::StoredRow;
use super::{counter, unique};
use crate::backend::BackendTransaction;
use crate::error::Error;

/// A pending write.
#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    /// Insert a new row; fails when the key is taken.
    Insert {
        /// Target table.
        table: TableRef,
        /// Complete row, key included.
        row: Row,
    },
    /// Merge columns into an existing row; fails when it is missing.
    Update {
        /// Target table.
        table: TableRef,
        /// Row key.
        id: Value,
        /// Columns to overwrite.
        changes: Row,
    },
    /// Insert or merge.
    Upsert {
        /// Target table.
        table: TableRef,
        /// Complete row, key included.
        row: Row,
    },
    /// Remove a row if present.
    Delete {
        /// Target table.
        table: TableRef,
        /// Row key.
        id: Value,
    },
}

/// Result of one applied operation.
#[derive(Debug, Clone)]
pub(crate) enum WriteOutcome {
    /// Row as stored after an insert, update or upsert.
    Written(Row),
    /// Whether a delete removed a row.
    Deleted(bool),
}

type TxResult<T> = Result<T, ConflictableTransactionError<Error>>;

fn abort(e: Error) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(e)
}

fn row_id(table: &TableRef, row: &Row) -> Result<Value, Error> {
    match row.get(&table.primary_key) {
        Some(id) if !id.is_null() => Ok(id.clone()),
        _ => Err(Error::validation(
            table.primary_key.clone(),
            "a primary key value is required",
        )),
    }
}

fn load(tx: &TransactionalTree, key: &[u8]) -> TxResult<Option<StoredRow>> {
    match tx.get(key)? {
        Some(bytes) => StoredRow::from_bytes(&bytes).map(Some).map_err(abort),
        None => Ok(None),
    }
}

fn store(tx: &TransactionalTree, key: Vec<u8>, row: &StoredRow) -> TxResult<()> {
    tx.insert(key, row.to_bytes().map_err(abort)?)?;
    Ok(())
}

fn apply_insert(tx: &TransactionalTree, table: &TableRef, row: &Row) -> TxResult<Row> {
    let id = row_id(table, row).map_err(abort)?;
    let owner = encode_id(&id).map_err(abort)?;
    let key = row_key(&table.name, &id).map_err(abort)?;
    if tx.get(&key)?.is_some() {
        return Err(abort(Error::UniquenessViolation {
            table: table.name.clone(),
            column: table.primary_key.clone(),
            value: format!("{id:?}"),
        }));
    }
    unique::claim_row(tx, table, row, &owner)?;
    store(tx, key, &StoredRow::new(row.clone()))?;
    Ok(row.clone())
}

fn apply_update(
    tx: &TransactionalTree,
    table: &TableRef,
    id: &Value,
    changes: &Row,
) -> TxResult<Row> {
    let owner = encode_id(id).map_err(abort)?;
    let key = row_key(&table.name, id).map_err(abort)?;
    let Some(existing) = load(tx, &key)? else {
        return Err(abort(Error::NotFound(format!(
            "{} row {:?}",
            table.name, id
        ))));
    };

    let mut merged = existing.columns.clone();
    for (column, value) in changes {
        if column == &table.primary_key && !value.loosely_equals(id) {
            return Err(abort(Error::InvalidData(format!(
                "primary key of {} row {:?} cannot change",
                table.name, id
            ))));
        }
        merged.insert(column.clone(), value.clone());
    }

    unique::reclaim_row(tx, table, &existing.columns, &merged, &owner)?;
    store(tx, key, &existing.rewrite(merged.clone()))?;
    Ok(merged)
}

fn apply_delete(tx: &TransactionalTree, table: &TableRef, id: &Value) -> TxResult<bool> {
    let owner = encode_id(id).map_err(abort)?;
    let key = row_key(&table.name, id).map_err(abort)?;
    let Some(existing) = load(tx, &key)? else {
        return Ok(false);
    };
    unique::release_row(tx, table, &existing.columns, &owner)?;
    tx.remove(key)?;
    Ok(true)
}

fn apply(tx: &TransactionalTree, op: &WriteOp) -> TxResult<WriteOutcome> {
    match op {
        WriteOp::Insert { table, row } => apply_insert(tx, table, row).map(WriteOutcome::Written),
        WriteOp::Update { table, id, changes } => {
            apply_update(tx, table, id, changes).map(WriteOutcome::Written)
        }
        WriteOp::Upsert { table, row } => {
            let id = row_id(table, row).map_err(abort)?;
            let key = row_key(&table.name, &id).map_err(abort)?;
            if tx.get(&key)?.is_some() {
                apply_update(tx, table, &id, row).map(WriteOutcome::Written)
            } else {
                apply_insert(tx, table, row).map(WriteOutcome::Written)
            }
        }
        WriteOp::Delete { table, id } => apply_delete(tx, table, id).map(WriteOutcome::Deleted),
    }
}

/// Apply operations atomically: all of them commit or none do.
pub(crate) fn commit_ops(tree: &Tree, ops: &[WriteOp]) -> Result<Vec<WriteOutcome>, Error> {
    if ops.is_empty() {
        return Ok(Vec::new());
    }
    for op in ops {
        let table = match op {
            WriteOp::Insert { table, .. }
            | WriteOp::Update { table, .. }
            | WriteOp::Upsert { table, .. }
            | WriteOp::Delete { table, .. } => table,
        };
        check_table_name(&table.name)?;
    }

    let result: Result<Vec<WriteOutcome>, TransactionError<Error>> = tree.transaction(|tx| {
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            outcomes.push(apply(tx, op)?);
        }
        Ok(outcomes)
    });

    match result {
        Ok(outcomes) => Ok(outcomes),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(Error::Storage(e)),
    }
}

/// Fill in a missing auto-increment key, or advance the counter past an explicit one.
pub(crate) fn assign_id(tree: &Tree, table: &TableRef, row: &mut Row) -> Result<Value, Error> {
    match row.get(&table.primary_key) {
        Some(Value::Int(id)) => {
            if table.auto_increment {
                counter::observe(tree, &table.name, *id)?;
            }
            Ok(Value::Int(*id))
        }
        Some(id) if !id.is_null() => Ok(id.clone()),
        _ if table.auto_increment => {
            let id = Value::Int(counter::allocate(tree, &table.name, 1)?);
            row.insert(table.primary_key.clone(), id.clone());
            Ok(id)
        }
        _ => Err(Error::validation(
            table.primary_key.clone(),
            "a primary key value is required",
        )),
    }
}

/// Assign keys to a batch of rows with a single counter reservation.
pub(crate) fn assign_ids(tree: &Tree, table: &TableRef, rows: &mut [Row]) -> Result<(), Error> {
    let missing = rows
        .iter()
        .filter(|r| r.get(&table.primary_key).map_or(true, Value::is_null))
        .count();

    if missing > 0 && !table.auto_increment {
        return Err(Error::validation(
            table.primary_key.clone(),
            "a primary key value is required",
        ));
    }

    // Explicit ids first, so allocated ones start above them.
    if table.auto_increment {
        for row in rows.iter() {
            if let Some(Value::Int(id)) = row.get(&table.primary_key) {
                counter::observe(tree, &table.name, *id)?;
            }
        }
    }
    if missing == 0 {
        return Ok(());
    }

    let mut next = counter::allocate(tree, &table.name, missing)?;
    for row in rows.iter_mut() {
        if row.get(&table.primary_key).map_or(true, Value::is_null) {
            row.insert(table.primary_key.clone(), Value::Int(next));
            next += 1;
        }
    }
    Ok(())
}

/// A queued transaction on the key-value backend.
pub struct KvTransaction {
    backend: String,
    tree: Tree,
    ops: Vec<WriteOp>,
}

impl KvTransaction {
    pub(crate) fn new(backend: impl Into<String>, tree: Tree) -> Self {
        Self {
            backend: backend.into(),
            tree,
            ops: Vec::new(),
        }
    }
}

#[async_trait]
impl BackendTransaction for KvTransaction {
    async fn set(&mut self, table: &TableRef, mut row: Row) -> Result<Value, Error> {
        check_table_name(&table.name)?;
        let id = assign_id(&self.tree, table, &mut row)?;
        self.ops.push(WriteOp::Upsert {
            table: table.clone(),
            row,
        });
        Ok(id)
    }

    fn delete(&mut self, table: &TableRef, id: Value) -> Result<(), Error> {
        check_table_name(&table.name)?;
        encode_id(&id)?;
        self.ops.push(WriteOp::Delete {
            table: table.clone(),
            id,
        });
        Ok(())
    }

    fn pending(&self) -> usize {
        self.ops.len()
    }

    async fn commit(self: Box<Self>) -> Result<usize, Error> {
        let count = self.ops.len();
        commit_ops(&self.tree, &self.ops)?;
        debug!(backend = %self.backend, ops = count, "transaction committed");
        Ok(count)
    }

    async fn rollback(self: Box<Self>) -> Result<(), Error> {
        debug!(backend = %self.backend, ops = self.ops.len(), "transaction rolled back");
        Ok(())
    }
}
