use crate::dialect::Dialect;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;

/// Row from a query result
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRow {
    pub columns: HashMap<String, Value>,
}

impl QueryRow {
    pub fn new() -> Self {
        Self {
            columns: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: String, value: Value) {
        self.columns.insert(key, value);
    }

    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.columns
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Raw value of a column, `Null` when absent
    pub fn value(&self, key: &str) -> &Value {
        self.columns.get(key).unwrap_or(&Value::Null)
    }

    /// Move a column out of the row
    pub fn take(&mut self, key: &str) -> Value {
        self.columns.remove(key).unwrap_or(Value::Null)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.columns
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.columns.get(key).and_then(|v| v.as_i64())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.columns.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.columns.get(key).and_then(|v| v.as_bool())
    }
}

impl Default for QueryRow {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a query
pub type QueryResult = Vec<QueryRow>;

/// Column as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub cid: i64,
    pub name: String,
    /// Declared type, e.g. `VARCHAR(32)` or `numeric(14,2)`
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// Secondary (non primary key) index as reported by the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
    /// Statement that created the index, when the catalog keeps it
    pub sql: Option<String>,
}

/// Database backend trait.
///
/// Statements arrive with placeholders already in the dialect's form; every
/// parameter is bound by the driver.
#[async_trait]
pub trait DatabaseBackend: Send {
    /// Connect to the database
    async fn connect(url: &str) -> Result<Self>
    where
        Self: Sized;

    fn dialect(&self) -> Dialect;

    /// Execute a SQL statement (no results)
    async fn execute(&mut self, sql: &str) -> Result<u64> {
        self.execute_with(sql, &[]).await
    }

    /// Execute a parameterized statement, returning affected rows
    async fn execute_with(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute several `;`-separated statements without parameters
    async fn execute_script(&mut self, sql: &str) -> Result<()>;

    /// Query and return results
    async fn query(&mut self, sql: &str) -> Result<QueryResult> {
        self.query_with(sql, &[]).await
    }

    async fn query_with(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Execute an INSERT and return the generated `id`
    async fn insert(&mut self, sql: &str, params: &[Value]) -> Result<i64>;

    /// Begin a transaction
    async fn begin_transaction(&mut self) -> Result<()>;

    /// Commit the current transaction
    async fn commit(&mut self) -> Result<()>;

    /// Rollback the current transaction
    async fn rollback(&mut self) -> Result<()>;

    fn in_transaction(&self) -> bool;

    /// Check if connected
    fn is_connected(&self) -> bool;

    /// Names of all user tables
    async fn list_tables(&mut self) -> Result<Vec<String>>;

    async fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>>;

    async fn table_indexes(&mut self, table: &str) -> Result<Vec<IndexInfo>>;

    /// Close the connection
    async fn close(self) -> Result<()>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_row_accessors() {
        let mut row = QueryRow::new();
        row.insert("id".to_string(), json!(7));
        row.insert("name".to_string(), json!("Alice"));
        row.insert("score".to_string(), json!(9.5));

        assert_eq!(row.get_i64("id"), Some(7));
        assert_eq!(row.get_string("name"), Some("Alice".to_string()));
        assert_eq!(row.get_f64("score"), Some(9.5));
        assert_eq!(row.get::<String>("name"), Some("Alice".to_string()));
        assert_eq!(row.value("missing"), &Value::Null);

        assert_eq!(row.take("name"), json!("Alice"));
        assert_eq!(row.get_string("name"), None);
    }
}
