//! Relation hop resolution.
//!
//! A clause such as `post__author__name__icontains` compiles to a filter with
//! two hops. Resolution walks the chain from the far end: the predicate runs
//! against the last target table, each hop then becomes a membership filter
//! on the previous table, and the outermost hop turns into an `in` clause on
//! the queried table. Every hop costs exactly one backend query.

use ormkv_proto::{Filter, Query, Value};
use tracing::trace;

use crate::backend::StorageBackend;
use crate::error::Error;

/// Rewrite every relation clause of a query into a local membership clause.
pub async fn resolve_relations(backend: &dyn StorageBackend, query: &Query) -> Result<Query, Error> {
    if query.is_flat() {
        return Ok(query.clone());
    }

    let mut resolved = query.clone();
    resolved.filters.clear();
    for filter in &query.filters {
        if filter.is_local() {
            resolved.filters.push(filter.clone());
        } else {
            let ids = resolve_chain(backend, filter, query.include_deprecated).await?;
            let mut clause = Filter::is_in(filter.hops[0].column.clone(), ids);
            clause.negated = filter.negated;
            resolved.filters.push(clause);
        }
    }
    Ok(resolved)
}

/// Identifiers of rows in `hops[0].target` whose chain satisfies the predicate.
async fn resolve_chain(
    backend: &dyn StorageBackend,
    filter: &Filter,
    include_deprecated: bool,
) -> Result<Vec<Value>, Error> {
    let Some(last) = filter.hops.last() else {
        return Ok(Vec::new());
    };

    let predicate = Filter::new(filter.column.clone(), filter.lookup, filter.operand.clone());
    let mut ids = collect_ids(
        backend,
        Query::new(last.target.clone()).with_filter(predicate),
        include_deprecated,
    )
    .await?;
    trace!(table = %last.target.name, matched = ids.len(), "resolved final hop");

    for pair in filter.hops.windows(2).rev() {
        let (from, to) = (&pair[0], &pair[1]);
        let query = Query::new(from.target.clone()).with_filter(Filter::is_in(to.column.clone(), ids));
        ids = collect_ids(backend, query, include_deprecated).await?;
        trace!(table = %from.target.name, matched = ids.len(), "resolved intermediate hop");
    }
    Ok(ids)
}

async fn collect_ids(
    backend: &dyn StorageBackend,
    mut query: Query,
    include_deprecated: bool,
) -> Result<Vec<Value>, Error> {
    let pk = query.table.primary_key.clone();
    query.include_deprecated = include_deprecated;
    query.projection = Some(vec![pk.clone()]);
    let rows = backend.execute(&query).await?;
    Ok(rows.into_iter().filter_map(|mut row| row.remove(&pk)).collect())
}
