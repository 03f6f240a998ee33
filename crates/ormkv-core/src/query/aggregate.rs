//! In-process aggregate computation.

use ormkv_proto::{AggregateFunction, AggregateResult, Aggregation, Row, Value};

use crate::error::Error;

/// Compute aggregations over rows.
///
/// `Sum` stays integral while every input is an integer and widens to float
/// otherwise. Null values are skipped by every function except `Count` with
/// no column.
pub fn compute(rows: &[Row], aggregations: &[Aggregation]) -> Result<Vec<AggregateResult>, Error> {
    aggregations
        .iter()
        .map(|agg| compute_one(rows, agg).map(|value| AggregateResult::new(&agg.alias, value)))
        .collect()
}

fn compute_one(rows: &[Row], agg: &Aggregation) -> Result<Value, Error> {
    let Some(column) = &agg.column else {
        return match agg.function {
            AggregateFunction::Count => Ok(Value::Int(rows.len() as i64)),
            other => Err(Error::InvalidData(format!(
                "{} requires a column",
                other.name().to_uppercase()
            ))),
        };
    };

    let values: Vec<&Value> = rows
        .iter()
        .filter_map(|row| row.get(column))
        .filter(|v| !v.is_null())
        .collect();

    match agg.function {
        AggregateFunction::Count => Ok(Value::Int(values.len() as i64)),
        AggregateFunction::Sum => sum(column, &values),
        AggregateFunction::Avg => {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let total = numbers(column, &values)?.iter().sum::<f64>();
            Ok(Value::Float(total / values.len() as f64))
        }
        AggregateFunction::Min => Ok(values
            .into_iter()
            .min_by(|a, b| a.sort_cmp(b))
            .cloned()
            .unwrap_or(Value::Null)),
        AggregateFunction::Max => Ok(values
            .into_iter()
            .max_by(|a, b| a.sort_cmp(b))
            .cloned()
            .unwrap_or(Value::Null)),
    }
}

fn sum(column: &str, values: &[&Value]) -> Result<Value, Error> {
    if values.is_empty() {
        return Ok(Value::Null);
    }
    if values.iter().all(|v| matches!(v, Value::Int(_))) {
        let mut total: i64 = 0;
        for value in values {
            if let Value::Int(i) = value {
                total = total.checked_add(*i).ok_or_else(|| {
                    Error::InvalidData(format!("SUM of '{column}' overflows"))
                })?;
            }
        }
        return Ok(Value::Int(total));
    }
    Ok(Value::Float(numbers(column, values)?.iter().sum()))
}

fn numbers(column: &str, values: &[&Value]) -> Result<Vec<f64>, Error> {
    values
        .iter()
        .map(|v| {
            v.as_f64().ok_or_else(|| {
                Error::InvalidData(format!(
                    "cannot aggregate {} value in numeric column '{column}'",
                    v.type_name()
                ))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Vec<Row> {
        [Some(3), Some(5), None, Some(10)]
            .into_iter()
            .map(|score| {
                let mut row = Row::new();
                row.insert("score".into(), score.map(Value::Int).unwrap_or(Value::Null));
                row.insert("name".into(), Value::Text(format!("n{}", score.unwrap_or(0))));
                row
            })
            .collect()
    }

    fn value(results: &[AggregateResult], alias: &str) -> Value {
        results.iter().find(|r| r.alias == alias).unwrap().value.clone()
    }

    #[test]
    fn test_basic_functions() {
        let results = compute(
            &rows(),
            &[
                Aggregation::count(),
                Aggregation::count_of("score"),
                Aggregation::sum("score"),
                Aggregation::avg("score"),
                Aggregation::min("score"),
                Aggregation::max("name"),
            ],
        )
        .unwrap();
        assert_eq!(value(&results, "count"), Value::Int(4));
        assert_eq!(value(&results, "score__count"), Value::Int(3));
        assert_eq!(value(&results, "score__sum"), Value::Int(18));
        assert_eq!(value(&results, "score__avg"), Value::Float(6.0));
        assert_eq!(value(&results, "score__min"), Value::Int(3));
        assert_eq!(value(&results, "name__max"), Value::Text("n5".into()));
    }

    #[test]
    fn test_empty_input() {
        let results = compute(&[], &[Aggregation::count(), Aggregation::sum("x")]).unwrap();
        assert_eq!(results[0].value, Value::Int(0));
        assert_eq!(results[1].value, Value::Null);
    }

    #[test]
    fn test_sum_of_text_fails() {
        assert!(compute(&rows(), &[Aggregation::sum("name")]).is_err());
    }
}
