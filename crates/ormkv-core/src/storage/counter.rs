//! Lock-free id allocation.
//!
//! Each table keeps its last allocated id under `_meta/counters/<table>`.
//! Allocation reads the counter, computes the new value and publishes it with
//! compare-and-swap, retrying when another writer got there first.

use sled::Tree;
use tracing::trace;

use super::key::counter_key;
use crate::error::Error;

fn decode_counter(bytes: &[u8]) -> Result<i64, Error> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::Deserialization("malformed id counter".into()))?;
    Ok(i64::from_be_bytes(buf))
}

/// Read the current counter value (0 when unset).
pub(crate) fn current(tree: &Tree, table: &str) -> Result<i64, Error> {
    match tree.get(counter_key(table))? {
        Some(bytes) => decode_counter(&bytes),
        None => Ok(0),
    }
}

/// Reserve `count` consecutive ids, returning the first.
pub(crate) fn allocate(tree: &Tree, table: &str, count: usize) -> Result<i64, Error> {
    let key = counter_key(table);
    let mut retries = 0u32;
    loop {
        let observed = tree.get(&key)?;
        let value = match &observed {
            Some(bytes) => decode_counter(bytes)?,
            None => 0,
        };
        let next = value
            .checked_add(count as i64)
            .ok_or_else(|| Error::InvalidData(format!("id counter for '{table}' overflowed")))?;

        match tree.compare_and_swap(&key, observed.as_ref(), Some(next.to_be_bytes().to_vec()))? {
            Ok(()) => {
                if retries > 0 {
                    trace!(table, retries, "id allocation contended");
                }
                return Ok(value + 1);
            }
            Err(_) => retries += 1,
        }
    }
}

/// Raise the counter to at least `id`, so later allocations skip it.
pub(crate) fn observe(tree: &Tree, table: &str, id: i64) -> Result<(), Error> {
    let key = counter_key(table);
    loop {
        let observed = tree.get(&key)?;
        let value = match &observed {
            Some(bytes) => decode_counter(bytes)?,
            None => 0,
        };
        if value >= id {
            return Ok(());
        }
        if tree
            .compare_and_swap(&key, observed.as_ref(), Some(id.to_be_bytes().to_vec()))?
            .is_ok()
        {
            return Ok(());
        }
    }
}
