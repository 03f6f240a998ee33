//! Unique-value claims.
//!
//! A unique column value is claimed by writing
//! `_meta/unique/<table>/<column>/<normalised value>` with the owning row's
//! encoded id. Claims are made inside the same sled transaction as the row
//! write, so two writers racing on equivalent values cannot both commit.

use ormkv_proto::{Row, TableRef, Value};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree};
use sled::Tree;
use tracing::debug;

use super::key::{row_prefix, unique_column_prefix, unique_key};
use super::record::StoredRow;
use crate::error::Error;

fn violation(table: &str, column: &str, value: &Value) -> ConflictableTransactionError<Error> {
    ConflictableTransactionError::Abort(Error::UniquenessViolation {
        table: table.to_string(),
        column: column.to_string(),
        value: render(value),
    })
}

fn render(value: &Value) -> String {
    match value {
        Value::Text(s) | Value::Decimal(s) | Value::Json(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Uuid(u) => hex::encode(u),
        other => format!("{other:?}"),
    }
}

/// Claim `value` of `column` for the row identified by `owner`.
pub(crate) fn claim(
    tx: &TransactionalTree,
    table: &str,
    column: &str,
    value: &Value,
    owner: &[u8],
) -> ConflictableTransactionResult<(), Error> {
    if value.is_null() {
        return Ok(());
    }
    let key = unique_key(table, column, value);
    if let Some(existing) = tx.get(&key)? {
        if existing.as_ref() != owner {
            return Err(violation(table, column, value));
        }
        return Ok(());
    }
    tx.insert(key, owner)?;
    Ok(())
}

/// Release a claim held by `owner`.
pub(crate) fn release(
    tx: &TransactionalTree,
    table: &str,
    column: &str,
    value: &Value,
    owner: &[u8],
) -> ConflictableTransactionResult<(), Error> {
    if value.is_null() {
        return Ok(());
    }
    let key = unique_key(table, column, value);
    if let Some(existing) = tx.get(&key)? {
        if existing.as_ref() == owner {
            tx.remove(key)?;
        }
    }
    Ok(())
}

/// Columns whose values are claimed: the declared unique columns plus a
/// primary key the caller supplies, which must not collide ignoring case.
fn claimed_columns(table: &TableRef) -> impl Iterator<Item = &String> {
    let natural_key = (!table.auto_increment && !table.unique.contains(&table.primary_key))
        .then_some(&table.primary_key);
    table.unique.iter().chain(natural_key)
}

/// Claim every unique column of a new row.
pub(crate) fn claim_row(
    tx: &TransactionalTree,
    table: &TableRef,
    row: &Row,
    owner: &[u8],
) -> ConflictableTransactionResult<(), Error> {
    for column in claimed_columns(table) {
        if let Some(value) = row.get(column) {
            claim(tx, &table.name, column, value, owner)?;
        }
    }
    Ok(())
}

/// Move claims from `before` to `after` for every unique column that changed.
pub(crate) fn reclaim_row(
    tx: &TransactionalTree,
    table: &TableRef,
    before: &Row,
    after: &Row,
    owner: &[u8],
) -> ConflictableTransactionResult<(), Error> {
    for column in &table.unique {
        let old = before.get(column).unwrap_or(&Value::Null);
        let new = after.get(column).unwrap_or(&Value::Null);
        if old.normalized() == new.normalized() {
            continue;
        }
        release(tx, &table.name, column, old, owner)?;
        claim(tx, &table.name, column, new, owner)?;
    }
    Ok(())
}

/// Release every unique claim of a deleted row.
pub(crate) fn release_row(
    tx: &TransactionalTree,
    table: &TableRef,
    row: &Row,
    owner: &[u8],
) -> ConflictableTransactionResult<(), Error> {
    for column in claimed_columns(table) {
        if let Some(value) = row.get(column) {
            release(tx, &table.name, column, value, owner)?;
        }
    }
    Ok(())
}

/// Drop all claims of a column.
pub(crate) fn clear_column(tree: &Tree, table: &str, column: &str) -> Result<usize, Error> {
    let mut batch = sled::Batch::default();
    let mut removed = 0;
    for entry in tree.scan_prefix(unique_column_prefix(table, column)) {
        let (key, _) = entry?;
        batch.remove(key);
        removed += 1;
    }
    tree.apply_batch(batch)?;
    Ok(removed)
}

/// Rebuild the claims of one column from the stored rows.
///
/// Fails with a uniqueness violation, leaving no claims behind, when two
/// existing rows hold equivalent values.
pub(crate) fn rebuild_column(tree: &Tree, table: &str, column: &str) -> Result<usize, Error> {
    clear_column(tree, table, column)?;

    let prefix = row_prefix(table);
    let mut claims = Vec::new();
    for entry in tree.scan_prefix(&prefix) {
        let (key, bytes) = entry?;
        let row = StoredRow::from_bytes(&bytes)?;
        if let Some(value) = row.columns.get(column) {
            if !value.is_null() {
                claims.push((value.clone(), key[prefix.len()..].to_vec()));
            }
        }
    }

    let result = tree.transaction(|tx| {
        for (value, owner) in &claims {
            claim(tx, table, column, value, owner)?;
        }
        Ok(())
    });
    match result {
        Ok(()) => {
            debug!(table, column, claims = claims.len(), "rebuilt unique claims");
            Ok(claims.len())
        }
        Err(sled::transaction::TransactionError::Abort(e)) => Err(e),
        Err(sled::transaction::TransactionError::Storage(e)) => Err(Error::Storage(e)),
    }
}
