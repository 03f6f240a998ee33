//! Key-value storage backend.
//!
//! This module provides a sled-based [`StorageBackend`](crate::backend::StorageBackend)
//! with atomic identifier allocation, case-insensitive unique claims and
//! batched schema maintenance.

mod config;
mod counter;
mod engine;
mod record;
mod schema;
mod transaction;
mod unique;

pub mod key;

pub use config::KvConfig;
pub use engine::KvBackend;
pub use record::StoredRow;
pub use schema::KvSchemaEditor;
pub use transaction::KvTransaction;

pub(crate) use engine::{read_json, write_json};
