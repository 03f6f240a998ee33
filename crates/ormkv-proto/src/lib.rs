//! ormkv storage values and compiled queries.
//!
//! This crate defines the types exchanged between the model layer and storage
//! backends, using rkyv for zero-copy serialization.
//!
//! # Modules
//!
//! - [`value`] - Storage values and rows
//! - [`query`] - Compiled query IR (filters, relation hops, ordering)
//! - [`aggregate`] - Aggregation requests and results
//! - [`error`] - Protocol error types
//!
//! # Serialization
//!
//! ```ignore
//! use ormkv_proto::Value;
//!
//! let value = Value::Text("hello".into());
//! let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&value).unwrap();
//! let back: Value = rkyv::from_bytes::<Value, rkyv::rancor::Error>(&bytes).unwrap();
//! ```

pub mod aggregate;
pub mod error;
pub mod query;
pub mod value;

pub use aggregate::{AggregateFunction, AggregateResult, Aggregation};
pub use error::Error;
pub use query::{Filter, Lookup, Operand, OrderDirection, OrderSpec, Query, RelationHop, TableRef};
pub use value::{Row, Value};
