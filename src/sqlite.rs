use crate::backend::{ColumnInfo, DatabaseBackend, IndexInfo, QueryResult, QueryRow};
use crate::dialect::Dialect;
use crate::error::{Result, StoreError};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
};
use sqlx::{Column, ConnectOptions, Connection, Row, TypeInfo, ValueRef};
use std::str::FromStr;

type SqliteQuery<'q> = Query<'q, Sqlite, <Sqlite as sqlx::Database>::Arguments<'q>>;

/// Embedded SQLite database on a single connection
pub struct SqliteBackend {
    conn: SqliteConnection,
    in_transaction: bool,
}

impl SqliteBackend {
    /// Open a SQLite database from a `sqlite:` URL
    pub async fn new(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        Self::open(options).await
    }

    /// Create an in-memory SQLite database
    pub async fn memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    /// Create a file-based SQLite database
    pub async fn file(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal);
        Self::open(options).await
    }

    async fn open(options: SqliteConnectOptions) -> Result<Self> {
        let conn = options.connect().await?;
        Ok(Self {
            conn,
            in_transaction: false,
        })
    }

    fn bind<'q>(mut query: SqliteQuery<'q>, params: &'q [Value]) -> SqliteQuery<'q> {
        for param in params {
            query = match param {
                Value::Null => query.bind(None::<String>),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64()),
                },
                Value::String(s) => query.bind(s.as_str()),
                other => query.bind(other.to_string()),
            };
        }
        query
    }

    /// Convert SQLite row to QueryRow by each value's storage class
    fn convert_row(row: &SqliteRow) -> Result<QueryRow> {
        let mut query_row = QueryRow::new();

        for (i, column) in row.columns().iter().enumerate() {
            let raw = row.try_get_raw(i)?;
            let value = if raw.is_null() {
                Value::Null
            } else {
                let storage = raw.type_info().name().to_string();
                match storage.as_str() {
                    "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(i)?),
                    "REAL" | "NUMERIC" => serde_json::Number::from_f64(row.try_get::<f64, _>(i)?)
                        .map(Value::Number)
                        .unwrap_or(Value::Null),
                    "BLOB" => Value::String(general_purpose::STANDARD.encode(row.try_get::<Vec<u8>, _>(i)?)),
                    "TEXT" | "DATE" | "TIME" | "DATETIME" => {
                        Value::String(row.try_get::<String, _>(i)?)
                    }
                    other => {
                        tracing::warn!(column = column.name(), storage = other, "unexpected column storage");
                        row.try_get::<String, _>(i)
                            .map(Value::String)
                            .unwrap_or(Value::Null)
                    }
                }
            };
            query_row.insert(column.name().to_string(), value);
        }

        Ok(query_row)
    }

    fn not_in_transaction() -> StoreError {
        StoreError::Transaction("Not in transaction".to_string())
    }
}

#[async_trait]
impl DatabaseBackend for SqliteBackend {
    async fn connect(url: &str) -> Result<Self> {
        Self::new(url).await
    }

    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    async fn execute_with(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let result = Self::bind(sqlx::query(sql), params)
            .execute(&mut self.conn)
            .await?;
        Ok(result.rows_affected())
    }

    async fn execute_script(&mut self, sql: &str) -> Result<()> {
        let conn = &mut self.conn;
        sqlx::Executor::execute(conn, sqlx::raw_sql(sql)).await?;
        Ok(())
    }

    async fn query_with(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let rows = Self::bind(sqlx::query(sql), params)
            .fetch_all(&mut self.conn)
            .await?;

        rows.iter().map(Self::convert_row).collect()
    }

    async fn insert(&mut self, sql: &str, params: &[Value]) -> Result<i64> {
        let result = Self::bind(sqlx::query(sql), params)
            .execute(&mut self.conn)
            .await?;
        Ok(result.last_insert_rowid())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(StoreError::Transaction(
                "Already in transaction".to_string(),
            ));
        }

        self.execute("BEGIN TRANSACTION").await?;
        self.in_transaction = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Self::not_in_transaction());
        }

        self.execute("COMMIT").await?;
        self.in_transaction = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Self::not_in_transaction());
        }

        self.in_transaction = false;
        self.execute("ROLLBACK").await?;
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn list_tables(&mut self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&mut self.conn)
        .await?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("name").map_err(StoreError::from))
            .collect()
    }

    async fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnInfo>> {
        let rows = sqlx::query(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?) ORDER BY cid",
        )
        .bind(table)
        .fetch_all(&mut self.conn)
        .await?;

        let mut columns = Vec::with_capacity(rows.len());
        for row in rows {
            columns.push(ColumnInfo {
                cid: row.try_get::<i64, _>("cid")?,
                name: row.try_get::<String, _>("name")?,
                type_name: row.try_get::<String, _>("type")?,
                not_null: row.try_get::<i64, _>("notnull")? != 0,
                default_value: row.try_get::<Option<String>, _>("dflt_value").ok().flatten(),
                primary_key: row.try_get::<i64, _>("pk")? != 0,
            });
        }

        Ok(columns)
    }

    async fn table_indexes(&mut self, table: &str) -> Result<Vec<IndexInfo>> {
        // origin 'c' = created by CREATE INDEX; constraint indexes belong to the table definition
        let rows = sqlx::query(
            "SELECT l.name AS name, l.\"unique\" AS is_unique, m.sql AS sql \
             FROM pragma_index_list(?) l \
             LEFT JOIN sqlite_master m ON m.type = 'index' AND m.name = l.name \
             WHERE l.origin = 'c' ORDER BY l.name",
        )
        .bind(table)
        .fetch_all(&mut self.conn)
        .await?;

        let mut indexes = Vec::with_capacity(rows.len());
        for row in rows {
            let name = row.try_get::<String, _>("name")?;
            let columns = sqlx::query("SELECT name FROM pragma_index_info(?) ORDER BY seqno")
                .bind(&name)
                .fetch_all(&mut self.conn)
                .await?
                .iter()
                .map(|r| r.try_get::<Option<String>, _>("name").map(Option::unwrap_or_default))
                .collect::<std::result::Result<Vec<_>, _>>()?;

            indexes.push(IndexInfo {
                unique: row.try_get::<i64, _>("is_unique")? != 0,
                sql: row.try_get::<Option<String>, _>("sql").ok().flatten(),
                columns,
                name,
            });
        }

        Ok(indexes)
    }

    async fn close(self) -> Result<()> {
        self.conn.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_sqlite_memory() {
        let backend = SqliteBackend::memory().await;
        assert!(backend.is_ok());
        assert_eq!(backend.unwrap().dialect(), Dialect::Sqlite);
    }

    #[tokio::test]
    async fn test_sqlite_create_table() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute("CREATE TABLE test_table (id INTEGER PRIMARY KEY, name TEXT NOT NULL)")
            .await
            .unwrap();

        let tables = backend.list_tables().await.unwrap();
        assert!(tables.contains(&"test_table".to_string()));
    }

    #[tokio::test]
    async fn test_sqlite_insert_query() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute("CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT, age INTEGER, score REAL)")
            .await
            .unwrap();

        let alice = backend
            .insert(
                "INSERT INTO users (name, age, score) VALUES (?, ?, ?)",
                &[json!("Alice"), json!(30), json!(9.5)],
            )
            .await
            .unwrap();
        let bob = backend
            .insert(
                "INSERT INTO users (name, age, score) VALUES (?, ?, ?)",
                &[json!("Bob"), json!(25), Value::Null],
            )
            .await
            .unwrap();
        assert_eq!((alice, bob), (1, 2));

        let results = backend
            .query_with("SELECT * FROM users WHERE age > ? ORDER BY id", &[json!(20)])
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].get_i64("id"), Some(1));
        assert_eq!(results[0].get_string("name"), Some("Alice".to_string()));
        assert_eq!(results[0].get_f64("score"), Some(9.5));

        assert_eq!(results[1].get_string("name"), Some("Bob".to_string()));
        assert_eq!(results[1].value("score"), &Value::Null);
    }

    #[tokio::test]
    async fn test_sqlite_injection_is_bound() {
        let mut backend = SqliteBackend::memory().await.unwrap();
        backend
            .execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)")
            .await
            .unwrap();

        let hostile = "x'); DROP TABLE notes; --";
        backend
            .execute_with("INSERT INTO notes (body) VALUES (?)", &[json!(hostile)])
            .await
            .unwrap();

        let rows = backend.query("SELECT body FROM notes").await.unwrap();
        assert_eq!(rows[0].get_string("body"), Some(hostile.to_string()));
    }

    #[tokio::test]
    async fn test_sqlite_transaction() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute("CREATE TABLE accounts (id INTEGER PRIMARY KEY, balance INTEGER)")
            .await
            .unwrap();
        backend
            .execute("INSERT INTO accounts (id, balance) VALUES (1, 100)")
            .await
            .unwrap();

        assert!(!backend.in_transaction());
        backend.begin_transaction().await.unwrap();
        assert!(backend.in_transaction());

        // Can't begin another transaction while one is active
        assert!(backend.begin_transaction().await.is_err());

        backend
            .execute("UPDATE accounts SET balance = 0 WHERE id = 1")
            .await
            .unwrap();
        backend.rollback().await.unwrap();

        let results = backend
            .query("SELECT balance FROM accounts WHERE id = 1")
            .await
            .unwrap();
        assert_eq!(results[0].get_i64("balance"), Some(100));
        assert!(backend.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_sqlite_table_columns() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute("CREATE TABLE products (id INTEGER PRIMARY KEY, name VARCHAR(40) NOT NULL DEFAULT 'x', price DECIMAL(10,2))")
            .await
            .unwrap();

        let info = backend.table_columns("products").await.unwrap();

        assert_eq!(info.len(), 3);
        assert_eq!(info[0].name, "id");
        assert!(info[0].primary_key);
        assert_eq!(info[1].name, "name");
        assert_eq!(info[1].type_name, "VARCHAR(40)");
        assert!(info[1].not_null);
        assert_eq!(info[1].default_value.as_deref(), Some("'x'"));
        assert_eq!(info[2].type_name, "DECIMAL(10,2)");
    }

    #[tokio::test]
    async fn test_sqlite_table_indexes() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute_script(
                "CREATE TABLE tags (id INTEGER PRIMARY KEY, label TEXT UNIQUE, owner INTEGER, pos INTEGER);
                 CREATE UNIQUE INDEX tags_unique_owner_pos ON tags (owner, pos);",
            )
            .await
            .unwrap();

        let indexes = backend.table_indexes("tags").await.unwrap();
        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].name, "tags_unique_owner_pos");
        assert!(indexes[0].unique);
        assert_eq!(indexes[0].columns, vec!["owner".to_string(), "pos".to_string()]);
        assert!(indexes[0].sql.as_deref().unwrap().starts_with("CREATE UNIQUE INDEX"));
    }

    #[tokio::test]
    async fn test_sqlite_blob() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute("CREATE TABLE files (id INTEGER PRIMARY KEY, data BLOB)")
            .await
            .unwrap();

        backend
            .execute("INSERT INTO files (id, data) VALUES (1, X'48656c6c6f')")
            .await
            .unwrap();

        let results = backend.query("SELECT data FROM files WHERE id = 1").await.unwrap();

        assert_eq!(results.len(), 1);
        // Blob is returned as base64 string
        assert_eq!(results[0].get_string("data"), Some("SGVsbG8=".to_string()));
    }

    #[tokio::test]
    async fn test_sqlite_unique_violation() {
        let mut backend = SqliteBackend::memory().await.unwrap();

        backend
            .execute("CREATE TABLE codes (id INTEGER PRIMARY KEY, code TEXT UNIQUE)")
            .await
            .unwrap();
        backend
            .execute("INSERT INTO codes (code) VALUES ('A')")
            .await
            .unwrap();

        let err = backend
            .execute("INSERT INTO codes (code) VALUES ('A')")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ConstraintViolation(_)));
    }
}
