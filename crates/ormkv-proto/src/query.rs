//! Compiled query types.
//!
//! A [`Query`] is what a queryset compiles to once field names have been
//! mapped to columns and operands converted to storage [`Value`]s. Backends
//! execute it without knowing anything about models.

use rkyv::{Archive, Deserialize, Serialize};

use crate::error::Error;
use crate::value::Value;

/// Storage-level description of a table targeted by a query or write.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct TableRef {
    /// Table name.
    pub name: String,
    /// Primary key column.
    pub primary_key: String,
    /// Whether the backend assigns integer identifiers to rows without one.
    pub auto_increment: bool,
    /// Columns carrying a case-insensitive unique constraint.
    pub unique: Vec<String>,
}

impl TableRef {
    /// Create a table reference with an auto-assigned `id` primary key.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: "id".to_string(),
            auto_increment: true,
            unique: Vec::new(),
        }
    }

    /// Set the primary key column.
    pub fn with_primary_key(mut self, column: impl Into<String>, auto_increment: bool) -> Self {
        self.primary_key = column.into();
        self.auto_increment = auto_increment;
        self
    }

    /// Add a unique column.
    pub fn with_unique(mut self, column: impl Into<String>) -> Self {
        self.unique.push(column.into());
        self
    }
}

/// Lookup operator applied to the final segment of a filter path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum Lookup {
    /// Equality (`IS NULL` when the operand is null).
    Exact,
    /// Case-insensitive string equality.
    IExact,
    /// Inequality.
    Ne,
    /// Substring match.
    Contains,
    /// Case-insensitive substring match.
    IContains,
    /// Prefix match.
    StartsWith,
    /// Case-insensitive prefix match.
    IStartsWith,
    /// Suffix match.
    EndsWith,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Less than.
    Lt,
    /// Less than or equal.
    Lte,
    /// Membership in a list.
    In,
    /// Non-membership in a list.
    NotIn,
    /// Null test; the operand is a boolean.
    IsNull,
}

impl Lookup {
    /// All lookups, in declaration order.
    pub const ALL: [Lookup; 15] = [
        Lookup::Exact,
        Lookup::IExact,
        Lookup::Ne,
        Lookup::Contains,
        Lookup::IContains,
        Lookup::StartsWith,
        Lookup::IStartsWith,
        Lookup::EndsWith,
        Lookup::Gt,
        Lookup::Gte,
        Lookup::Lt,
        Lookup::Lte,
        Lookup::In,
        Lookup::NotIn,
        Lookup::IsNull,
    ];

    /// Parse a lookup suffix (`icontains`, `gte`, ...).
    pub fn parse(name: &str) -> Option<Lookup> {
        Self::ALL.into_iter().find(|l| l.name() == name)
    }

    /// The suffix used in filter paths.
    pub fn name(&self) -> &'static str {
        match self {
            Lookup::Exact => "exact",
            Lookup::IExact => "iexact",
            Lookup::Ne => "ne",
            Lookup::Contains => "contains",
            Lookup::IContains => "icontains",
            Lookup::StartsWith => "startswith",
            Lookup::IStartsWith => "istartswith",
            Lookup::EndsWith => "endswith",
            Lookup::Gt => "gt",
            Lookup::Gte => "gte",
            Lookup::Lt => "lt",
            Lookup::Lte => "lte",
            Lookup::In => "in",
            Lookup::NotIn => "not_in",
            Lookup::IsNull => "isnull",
        }
    }

    /// Whether the operand must be a list.
    pub fn takes_list(&self) -> bool {
        matches!(self, Lookup::In | Lookup::NotIn)
    }

    /// Whether the operand is matched as text.
    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            Lookup::IExact
                | Lookup::Contains
                | Lookup::IContains
                | Lookup::StartsWith
                | Lookup::IStartsWith
                | Lookup::EndsWith
        )
    }
}

impl std::fmt::Display for Lookup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Right-hand side of a filter.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub enum Operand {
    /// A single value.
    Single(Value),
    /// A list of values, for `in` / `not_in`.
    List(Vec<Value>),
}

impl Operand {
    /// The operand as a single value; lists yield `None`.
    pub fn as_single(&self) -> Option<&Value> {
        match self {
            Operand::Single(v) => Some(v),
            Operand::List(_) => None,
        }
    }

    /// The operand as a list; a single value is treated as a one-element list.
    pub fn as_list(&self) -> &[Value] {
        match self {
            Operand::Single(v) => std::slice::from_ref(v),
            Operand::List(vs) => vs,
        }
    }
}

/// One foreign-key step in a filter path.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct RelationHop {
    /// Foreign key column on the table the hop starts from.
    pub column: String,
    /// Table the foreign key points at.
    pub target: TableRef,
}

/// A single compiled filter clause.
///
/// With no hops the predicate applies to `column` of the queried table. With
/// hops, `column` belongs to the last hop's target table and the clause holds
/// for a row whose foreign-key chain reaches a matching target row.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Filter {
    /// Foreign-key chain walked before applying the predicate.
    pub hops: Vec<RelationHop>,
    /// Column the predicate tests.
    pub column: String,
    /// Lookup operator.
    pub lookup: Lookup,
    /// Operand.
    pub operand: Operand,
    /// Whether the clause is negated (`exclude`).
    pub negated: bool,
}

impl Filter {
    /// Create a filter on a local column.
    pub fn new(column: impl Into<String>, lookup: Lookup, operand: Operand) -> Self {
        Self {
            hops: Vec::new(),
            column: column.into(),
            lookup,
            operand,
            negated: false,
        }
    }

    /// Equality filter on a local column.
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, Lookup::Exact, Operand::Single(value.into()))
    }

    /// Membership filter on a local column.
    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(column, Lookup::In, Operand::List(values))
    }

    /// Prepend relation hops.
    pub fn through(mut self, hops: Vec<RelationHop>) -> Self {
        self.hops = hops;
        self
    }

    /// Negate the clause.
    pub fn negate(mut self) -> Self {
        self.negated = !self.negated;
        self
    }

    /// Whether the clause can be decided from a single row.
    pub fn is_local(&self) -> bool {
        self.hops.is_empty()
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum OrderDirection {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

/// Ordering on a single column.
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Column name.
    pub column: String,
    /// Sort direction.
    pub direction: OrderDirection,
}

impl OrderSpec {
    /// Create an ascending order spec.
    pub fn asc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Asc,
        }
    }

    /// Create a descending order spec.
    pub fn desc(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            direction: OrderDirection::Desc,
        }
    }

    /// Parse `name` / `-name` notation.
    pub fn parse(spec: &str) -> Self {
        match spec.strip_prefix('-') {
            Some(column) => Self::desc(column),
            None => Self::asc(spec),
        }
    }
}

/// A compiled query against one table.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Query {
    /// Target table.
    pub table: TableRef,
    /// Conjunctive filter clauses.
    pub filters: Vec<Filter>,
    /// Ordering, applied with a stable sort.
    pub order: Vec<OrderSpec>,
    /// Rows to skip after ordering.
    pub offset: usize,
    /// Maximum rows to return.
    pub limit: Option<usize>,
    /// Columns to return; `None` returns every column.
    pub projection: Option<Vec<String>>,
    /// Whether deprecated tables and columns are visible.
    pub include_deprecated: bool,
}

impl Query {
    /// Create a query returning every row of a table.
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order: Vec::new(),
            offset: 0,
            limit: None,
            projection: None,
            include_deprecated: false,
        }
    }

    /// Add a filter clause.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Add an ordering clause.
    pub fn with_order(mut self, order: OrderSpec) -> Self {
        self.order.push(order);
        self
    }

    /// Set the offset.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Set the limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the projection.
    pub fn with_projection(mut self, columns: Vec<String>) -> Self {
        self.projection = Some(columns);
        self
    }

    /// Make deprecated tables and columns visible.
    pub fn with_deprecated(mut self) -> Self {
        self.include_deprecated = true;
        self
    }

    /// Whether every filter clause is local to the table.
    pub fn is_flat(&self) -> bool {
        self.filters.iter().all(Filter::is_local)
    }

    /// Check operand shapes against their lookups.
    pub fn validate(&self) -> Result<(), Error> {
        for filter in &self.filters {
            match (&filter.operand, filter.lookup.takes_list()) {
                (Operand::List(_), false) => {
                    return Err(Error::InvalidQuery(format!(
                        "lookup '{}' on '{}' does not accept a list",
                        filter.lookup, filter.column
                    )));
                }
                (Operand::Single(_), true) => {
                    return Err(Error::InvalidQuery(format!(
                        "lookup '{}' on '{}' requires a list",
                        filter.lookup, filter.column
                    )));
                }
                _ => {}
            }
            if filter.lookup == Lookup::IsNull
                && filter.operand.as_single().and_then(Value::as_bool).is_none()
            {
                return Err(Error::InvalidQuery(format!(
                    "lookup 'isnull' on '{}' requires a boolean",
                    filter.column
                )));
            }
        }
        Ok(())
    }
}
