//! Query construction and execution.
//!
//! Filter paths compile into [`ormkv_proto::Query`] values. Relation hops are
//! resolved by [`resolve_relations`], one backend query per hop, and the
//! remaining flat query runs through the row pipeline in [`executor`].

pub mod aggregate;
pub mod executor;
mod filter;
pub mod lookup;
mod manager;
mod queryset;
mod resolve;

pub use filter::FilterEvaluator;
pub use lookup::{LookupValue, LOOKUP_SEP};
pub use manager::Manager;
pub use queryset::{QuerySet, SaveSummary};
pub use resolve::resolve_relations;
