//! Aggregation request and result types.

use rkyv::{Archive, Deserialize, Serialize};

use crate::value::Value;

/// Aggregate function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum AggregateFunction {
    /// Number of rows, or of non-null values when a column is given.
    Count,
    /// Sum of numeric values.
    Sum,
    /// Arithmetic mean of numeric values.
    Avg,
    /// Smallest value.
    Min,
    /// Largest value.
    Max,
}

impl AggregateFunction {
    /// Lowercase function name, used to build default aliases.
    pub fn name(&self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }
}

/// A single aggregation over a column.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct Aggregation {
    /// Function to apply.
    pub function: AggregateFunction,
    /// Column to aggregate; `None` only makes sense for `Count`.
    pub column: Option<String>,
    /// Name of the result.
    pub alias: String,
}

impl Aggregation {
    fn on(function: AggregateFunction, column: impl Into<String>) -> Self {
        let column = column.into();
        Self {
            alias: format!("{}__{}", column, function.name()),
            function,
            column: Some(column),
        }
    }

    /// Count all rows.
    pub fn count() -> Self {
        Self {
            function: AggregateFunction::Count,
            column: None,
            alias: "count".to_string(),
        }
    }

    /// Count non-null values of a column.
    pub fn count_of(column: impl Into<String>) -> Self {
        Self::on(AggregateFunction::Count, column)
    }

    /// Sum a column.
    pub fn sum(column: impl Into<String>) -> Self {
        Self::on(AggregateFunction::Sum, column)
    }

    /// Average a column.
    pub fn avg(column: impl Into<String>) -> Self {
        Self::on(AggregateFunction::Avg, column)
    }

    /// Minimum of a column.
    pub fn min(column: impl Into<String>) -> Self {
        Self::on(AggregateFunction::Min, column)
    }

    /// Maximum of a column.
    pub fn max(column: impl Into<String>) -> Self {
        Self::on(AggregateFunction::Max, column)
    }

    /// Override the result alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }
}

/// Result of one aggregation.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct AggregateResult {
    /// Alias of the aggregation.
    pub alias: String,
    /// Computed value; `Null` for empty inputs except `Count`.
    pub value: Value,
}

impl AggregateResult {
    /// Create a result.
    pub fn new(alias: impl Into<String>, value: Value) -> Self {
        Self {
            alias: alias.into(),
            value,
        }
    }
}
