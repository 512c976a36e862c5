//! Parameterized statement builders.
//!
//! Every value travels as a positional `?` parameter next to the SQL text and is
//! bound by the driver; [`Connection`](crate::connection::Connection) rewrites
//! placeholders for dialects that number them. Identifiers are double-quoted.

use crate::error::{Result, StoreError};
use serde_json::Value;
use std::fmt;

/// SQL text plus its positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Statement without parameters
    pub fn raw(sql: impl Into<String>) -> Self {
        Self::new(sql, Vec::new())
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql)
    }
}

pub(crate) fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Comparison operators for WHERE clauses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl fmt::Display for ComparisonOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonOp::Eq => write!(f, "="),
            ComparisonOp::Ne => write!(f, "<>"),
            ComparisonOp::Lt => write!(f, "<"),
            ComparisonOp::Le => write!(f, "<="),
            ComparisonOp::Gt => write!(f, ">"),
            ComparisonOp::Ge => write!(f, ">="),
            ComparisonOp::Like => write!(f, "LIKE"),
            ComparisonOp::NotLike => write!(f, "NOT LIKE"),
            ComparisonOp::In => write!(f, "IN"),
            ComparisonOp::NotIn => write!(f, "NOT IN"),
            ComparisonOp::IsNull => write!(f, "IS NULL"),
            ComparisonOp::IsNotNull => write!(f, "IS NOT NULL"),
        }
    }
}

/// Logical operators for combining conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
}

impl fmt::Display for LogicalOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalOp::And => write!(f, "AND"),
            LogicalOp::Or => write!(f, "OR"),
        }
    }
}

/// Sort direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl fmt::Display for SortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortDirection::Asc => write!(f, "ASC"),
            SortDirection::Desc => write!(f, "DESC"),
        }
    }
}

/// WHERE condition
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Simple {
        column: String,
        op: ComparisonOp,
        value: Option<Value>,
    },
    Compound {
        conditions: Vec<Condition>,
        op: LogicalOp,
    },
    /// Caller-written SQL with `?` placeholders
    Raw { sql: String, params: Vec<Value> },
}

impl Condition {
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Condition::Simple {
            column: column.into(),
            op: ComparisonOp::Eq,
            value: Some(value.into()),
        }
    }

    pub fn is_in(column: impl Into<String>, values: Vec<Value>) -> Self {
        Condition::Simple {
            column: column.into(),
            op: ComparisonOp::In,
            value: Some(Value::Array(values)),
        }
    }

    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Condition::Raw {
            sql: sql.into(),
            params,
        }
    }

    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::Compound {
                mut conditions,
                op: LogicalOp::And,
            } => {
                conditions.push(other);
                Condition::Compound {
                    conditions,
                    op: LogicalOp::And,
                }
            }
            this => Condition::Compound {
                conditions: vec![this, other],
                op: LogicalOp::And,
            },
        }
    }

    /// Rewrite simple comparisons to use a per-column placeholder expression
    pub fn with_placeholders<F>(self, placeholder: &F) -> Condition
    where
        F: Fn(&str) -> &'static str,
    {
        match self {
            Condition::Simple { column, op, value } => {
                let mut params = Vec::new();
                let sql = simple_sql(&column, op, value.as_ref(), placeholder(&column), &mut params);
                Condition::Raw { sql, params }
            }
            Condition::Compound { conditions, op } => Condition::Compound {
                conditions: conditions
                    .into_iter()
                    .map(|c| c.with_placeholders(placeholder))
                    .collect(),
                op,
            },
            raw => raw,
        }
    }

    /// Render the condition, appending its parameters in placeholder order
    pub fn to_sql(&self, params: &mut Vec<Value>) -> String {
        match self {
            Condition::Simple { column, op, value } => {
                simple_sql(column, *op, value.as_ref(), "?", params)
            }
            Condition::Compound { conditions, op } => {
                if conditions.is_empty() {
                    "1 = 1".to_string()
                } else {
                    let parts = conditions
                        .iter()
                        .map(|c| c.to_sql(params))
                        .collect::<Vec<_>>()
                        .join(&format!(" {} ", op));
                    format!("({})", parts)
                }
            }
            Condition::Raw { sql, params: raw } => {
                params.extend(raw.iter().cloned());
                sql.clone()
            }
        }
    }
}

fn simple_sql(
    column: &str,
    op: ComparisonOp,
    value: Option<&Value>,
    placeholder: &str,
    params: &mut Vec<Value>,
) -> String {
    let column = quote(column);
    if matches!(op, ComparisonOp::IsNull | ComparisonOp::IsNotNull) {
        format!("{} {}", column, op)
    } else if matches!(op, ComparisonOp::In | ComparisonOp::NotIn) {
        let values = match value {
            Some(Value::Array(values)) => values.as_slice(),
            _ => &[],
        };
        if values.is_empty() {
            // IN () is not valid SQL
            return match op {
                ComparisonOp::In => "1 = 0".to_string(),
                _ => "1 = 1".to_string(),
            };
        }
        params.extend(values.iter().cloned());
        let placeholders = vec![placeholder; values.len()].join(", ");
        format!("{} {} ({})", column, op, placeholders)
    } else {
        match value {
            None | Some(Value::Null) if op == ComparisonOp::Eq => format!("{} IS NULL", column),
            None | Some(Value::Null) if op == ComparisonOp::Ne => {
                format!("{} IS NOT NULL", column)
            }
            _ => {
                params.push(value.cloned().unwrap_or(Value::Null));
                format!("{} {} {}", column, op, placeholder)
            }
        }
    }
}

/// ORDER BY clause
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub direction: SortDirection,
}

impl OrderBy {
    pub fn to_sql(&self) -> String {
        format!("{} {}", quote(&self.column), self.direction)
    }
}

/// SELECT query builder
#[derive(Debug, Clone)]
pub struct SelectBuilder {
    table: String,
    columns: Vec<String>,
    where_clause: Option<Condition>,
    order_by: Vec<OrderBy>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl SelectBuilder {
    /// Create a new SELECT query builder
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: vec!["*".to_string()],
            where_clause: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Select expressions, used verbatim
    pub fn select(mut self, expressions: Vec<impl Into<String>>) -> Self {
        self.columns = expressions.into_iter().map(|c| c.into()).collect();
        self
    }

    /// Add a plain column to select
    pub fn add_column(mut self, column: &str) -> Self {
        if self.columns == ["*"] {
            self.columns.clear();
        }
        self.columns.push(quote(column));
        self
    }

    /// Select `COUNT(*) AS "count"`
    pub fn count(mut self) -> Self {
        self.columns = vec![format!("COUNT(*) AS {}", quote("count"))];
        self
    }

    /// Add a WHERE condition
    pub fn where_clause(mut self, condition: Condition) -> Self {
        self.where_clause = Some(condition);
        self
    }

    /// Add an AND condition to existing WHERE
    pub fn and_where(mut self, condition: Condition) -> Self {
        self.where_clause = Some(match self.where_clause {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    /// Add a simple WHERE condition (column = value)
    pub fn where_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and_where(Condition::eq(column, value))
    }

    /// Add a WHERE column IN (...) condition
    pub fn where_in(self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.and_where(Condition::is_in(column, values))
    }

    /// Add ORDER BY
    pub fn order_by(mut self, column: impl Into<String>, direction: SortDirection) -> Self {
        self.order_by.push(OrderBy {
            column: column.into(),
            direction,
        });
        self
    }

    /// Add ascending ORDER BY
    pub fn order_asc(self, column: impl Into<String>) -> Self {
        self.order_by(column, SortDirection::Asc)
    }

    /// Add descending ORDER BY
    pub fn order_desc(self, column: impl Into<String>) -> Self {
        self.order_by(column, SortDirection::Desc)
    }

    /// Set LIMIT
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set OFFSET
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Build the statement
    pub fn build(self) -> Result<Statement> {
        if self.columns.is_empty() {
            return Err(StoreError::Query("SELECT must have at least one column".to_string()));
        }

        let mut params = Vec::new();
        let mut sql = format!("SELECT {} FROM {}", self.columns.join(", "), quote(&self.table));

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.to_sql(&mut params));
        }

        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(
                &self
                    .order_by
                    .iter()
                    .map(|o| o.to_sql())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }

        match (self.limit, self.offset) {
            (Some(limit), _) => sql.push_str(&format!(" LIMIT {}", limit)),
            // OFFSET needs a LIMIT on SQLite
            (None, Some(_)) => sql.push_str(&format!(" LIMIT {}", i64::MAX)),
            (None, None) => {}
        }

        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {}", offset));
        }

        Ok(Statement::new(sql, params))
    }
}

/// INSERT builder, single or multi-row
#[derive(Debug, Clone)]
pub struct InsertBuilder {
    table: String,
    columns: Vec<(String, String)>,
    rows: Vec<Vec<Value>>,
}

impl InsertBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Add a column bound through `param_expr` (`?` or a cast such as `?::DATE`)
    pub fn column(mut self, column: impl Into<String>, param_expr: impl Into<String>) -> Self {
        self.columns.push((column.into(), param_expr.into()));
        self
    }

    /// Add one row of values, in column order
    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    pub fn build(self) -> Result<Statement> {
        if self.columns.is_empty() {
            return Ok(Statement::raw(format!(
                "INSERT INTO {} DEFAULT VALUES",
                quote(&self.table)
            )));
        }
        if self.rows.is_empty() {
            return Err(StoreError::Query("INSERT must have at least one row".to_string()));
        }

        let tuple = format!(
            "({})",
            self.columns
                .iter()
                .map(|(_, expr)| expr.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut params = Vec::with_capacity(self.columns.len() * self.rows.len());
        for row in self.rows {
            if row.len() != self.columns.len() {
                return Err(StoreError::Query(format!(
                    "INSERT row has {} values for {} columns",
                    row.len(),
                    self.columns.len()
                )));
            }
            params.extend(row);
        }

        let sql = format!(
            "INSERT INTO {} ({}) VALUES {}",
            quote(&self.table),
            self.columns
                .iter()
                .map(|(c, _)| quote(c))
                .collect::<Vec<_>>()
                .join(", "),
            vec![tuple; params.len() / self.columns.len()].join(", ")
        );
        Ok(Statement::new(sql, params))
    }
}

/// UPDATE query builder
#[derive(Debug, Clone)]
pub struct UpdateBuilder {
    table: String,
    set_values: Vec<(String, String, Value)>,
    where_clause: Option<Condition>,
}

impl UpdateBuilder {
    /// Create a new UPDATE query builder
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            set_values: Vec::new(),
            where_clause: None,
        }
    }

    /// Set a column value
    pub fn set(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_with(column, "?", value)
    }

    /// Set a column value bound through `param_expr`
    pub fn set_with(
        mut self,
        column: impl Into<String>,
        param_expr: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.set_values
            .push((column.into(), param_expr.into(), value.into()));
        self
    }

    /// Add simple WHERE condition (column = value)
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let condition = Condition::eq(column, value);
        self.where_clause = Some(match self.where_clause {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    /// Build the statement
    pub fn build(self) -> Result<Statement> {
        if self.set_values.is_empty() {
            return Err(StoreError::Query("UPDATE must have at least one SET value".to_string()));
        }

        let mut params = Vec::with_capacity(self.set_values.len() + 1);
        let set_clauses: Vec<String> = self
            .set_values
            .into_iter()
            .map(|(col, expr, val)| {
                params.push(val);
                format!("{} = {}", quote(&col), expr)
            })
            .collect();

        let mut sql = format!("UPDATE {} SET {}", quote(&self.table), set_clauses.join(", "));

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.to_sql(&mut params));
        }

        Ok(Statement::new(sql, params))
    }
}

/// DELETE query builder
#[derive(Debug, Clone)]
pub struct DeleteBuilder {
    table: String,
    where_clause: Option<Condition>,
}

impl DeleteBuilder {
    /// Create a new DELETE query builder
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            where_clause: None,
        }
    }

    /// Add WHERE condition
    pub fn where_clause(mut self, condition: Condition) -> Self {
        self.where_clause = Some(condition);
        self
    }

    /// Add simple WHERE condition (column = value)
    pub fn where_eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        let condition = Condition::eq(column, value);
        self.where_clause = Some(match self.where_clause {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    /// Build the statement
    pub fn build(self) -> Result<Statement> {
        let mut params = Vec::new();
        let mut sql = format!("DELETE FROM {}", quote(&self.table));

        if let Some(where_clause) = &self.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause.to_sql(&mut params));
        }

        Ok(Statement::new(sql, params))
    }
}
