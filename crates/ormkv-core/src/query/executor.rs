//! Row pipeline shared by backends and fetched querysets.
//!
//! Stages run in a fixed order: filter, stable sort, offset/limit, projection.

use std::cmp::Ordering;

use ormkv_proto::{Filter, OrderDirection, OrderSpec, Query, Row, Value};

use super::filter::FilterEvaluator;
use crate::error::Error;

/// Keep rows matching every clause.
pub fn filter_rows(rows: Vec<Row>, filters: &[Filter]) -> Result<Vec<Row>, Error> {
    if filters.is_empty() {
        return Ok(rows);
    }
    let mut kept = Vec::with_capacity(rows.len());
    for row in rows {
        if FilterEvaluator::matches_all(filters, &row)? {
            kept.push(row);
        }
    }
    Ok(kept)
}

/// Compare two rows under an ordering. Missing columns sort as null.
pub fn compare_rows(a: &Row, b: &Row, order: &[OrderSpec]) -> Ordering {
    for spec in order {
        let left = a.get(&spec.column).unwrap_or(&Value::Null);
        let right = b.get(&spec.column).unwrap_or(&Value::Null);
        let ord = match spec.direction {
            OrderDirection::Asc => left.sort_cmp(right),
            OrderDirection::Desc => right.sort_cmp(left),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// Stable sort; rows equal under `order` keep their relative position.
pub fn sort_rows(rows: &mut [Row], order: &[OrderSpec]) {
    if !order.is_empty() {
        rows.sort_by(|a, b| compare_rows(a, b, order));
    }
}

/// Apply offset then limit.
pub fn paginate<T>(rows: Vec<T>, offset: usize, limit: Option<usize>) -> Vec<T> {
    let iter = rows.into_iter().skip(offset);
    match limit {
        Some(limit) => iter.take(limit).collect(),
        None => iter.collect(),
    }
}

/// Keep only the listed columns, in the row's own order.
pub fn project(rows: Vec<Row>, columns: &[String]) -> Vec<Row> {
    rows.into_iter()
        .map(|row| {
            row.into_iter()
                .filter(|(name, _)| columns.iter().any(|c| c == name))
                .collect()
        })
        .collect()
}

/// Run every stage of a flat query over candidate rows.
pub fn run(query: &Query, rows: Vec<Row>) -> Result<Vec<Row>, Error> {
    let mut rows = filter_rows(rows, &query.filters)?;
    sort_rows(&mut rows, &query.order);
    let rows = paginate(rows, query.offset, query.limit);
    Ok(match &query.projection {
        Some(columns) => project(rows, columns),
        None => rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormkv_proto::TableRef;

    fn person(id: i64, name: &str, age: Option<i64>) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), Value::Int(id));
        row.insert("name".into(), Value::Text(name.into()));
        row.insert("age".into(), age.map(Value::Int).unwrap_or(Value::Null));
        row
    }

    fn people() -> Vec<Row> {
        vec![
            person(1, "Carol", Some(40)),
            person(2, "alice", Some(30)),
            person(3, "Bob", None),
            person(4, "Dave", Some(30)),
        ]
    }

    fn ids(rows: &[Row]) -> Vec<i64> {
        rows.iter().filter_map(|r| r["id"].as_i64()).collect()
    }

    #[test]
    fn test_sort_is_stable_with_nulls_first() {
        let mut rows = people();
        sort_rows(&mut rows, &[OrderSpec::asc("age")]);
        assert_eq!(ids(&rows), vec![3, 2, 4, 1]);

        sort_rows(&mut rows, &[OrderSpec::desc("age"), OrderSpec::asc("name")]);
        assert_eq!(ids(&rows), vec![1, 4, 2, 3]);
    }

    #[test]
    fn test_offset_limit_projection() {
        let query = Query::new(TableRef::new("people"))
            .with_order(OrderSpec::asc("id"))
            .with_offset(1)
            .with_limit(2)
            .with_projection(vec!["name".into()]);
        let rows = run(&query, people()).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].len(), 1);
        assert_eq!(rows[0]["name"], Value::Text("alice".into()));
    }

    #[test]
    fn test_offset_past_end() {
        assert!(paginate(people(), 10, None).is_empty());
        assert_eq!(paginate(people(), 0, Some(0)).len(), 0);
    }

    #[test]
    fn test_filter_then_order() {
        let query = Query::new(TableRef::new("people"))
            .with_filter(Filter::eq("age", 30))
            .with_order(OrderSpec::desc("id"));
        assert_eq!(ids(&run(&query, people()).unwrap()), vec![4, 2]);
    }
}
