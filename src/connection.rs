use crate::backend::{DatabaseBackend, QueryResult};
use crate::builder::Statement;
use crate::config::{DatabaseConfig, StoreConfig};
use crate::dialect::Dialect;
use crate::error::{Result, StoreError};
use std::collections::{BTreeMap, HashMap, VecDeque};

const RECENT_STATEMENTS: usize = 64;

/// Statement classification used for counting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Other,
}

impl StatementKind {
    pub fn of(sql: &str) -> Self {
        let keyword = sql
            .trim_start()
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        match keyword.as_str() {
            "SELECT" | "WITH" => StatementKind::Select,
            "INSERT" => StatementKind::Insert,
            "UPDATE" => StatementKind::Update,
            "DELETE" => StatementKind::Delete,
            _ => StatementKind::Other,
        }
    }
}

/// Per-connection record of executed statements
#[derive(Debug, Default, Clone)]
pub struct StatementLog {
    counts: HashMap<StatementKind, usize>,
    recent: VecDeque<String>,
}

impl StatementLog {
    fn record(&mut self, sql: &str) {
        *self.counts.entry(StatementKind::of(sql)).or_default() += 1;
        if self.recent.len() == RECENT_STATEMENTS {
            self.recent.pop_front();
        }
        self.recent.push_back(sql.to_string());
    }

    pub fn count(&self, kind: StatementKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    /// Most recent statements, oldest first
    pub fn recent(&self) -> impl Iterator<Item = &str> {
        self.recent.iter().map(String::as_str)
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.recent.clear();
    }
}

/// A named database connection
pub struct Connection {
    id: String,
    backend: Box<dyn DatabaseBackend>,
    log: StatementLog,
}

impl Connection {
    pub fn new(id: impl Into<String>, backend: Box<dyn DatabaseBackend>) -> Self {
        Self {
            id: id.into(),
            backend,
            log: StatementLog::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dialect(&self) -> Dialect {
        self.backend.dialect()
    }

    fn prepare(&mut self, statement: &Statement) -> String {
        let sql = self.backend.dialect().finalize_placeholders(&statement.sql);
        tracing::debug!(
            connection = %self.id,
            sql = %sql,
            params = statement.params.len(),
            "execute statement"
        );
        self.log.record(&sql);
        sql
    }

    pub async fn fetch(&mut self, statement: &Statement) -> Result<QueryResult> {
        let sql = self.prepare(statement);
        self.backend.query_with(&sql, &statement.params).await
    }

    pub async fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let sql = self.prepare(statement);
        self.backend.execute_with(&sql, &statement.params).await
    }

    /// Run an INSERT and return the generated id
    pub async fn insert(&mut self, statement: &Statement) -> Result<i64> {
        let sql = self.prepare(statement);
        self.backend.insert(&sql, &statement.params).await
    }

    /// Run a parameterless multi-statement script
    pub async fn execute_script(&mut self, sql: &str) -> Result<()> {
        tracing::debug!(connection = %self.id, sql = %sql, "execute script");
        self.log.record(sql);
        self.backend.execute_script(sql).await
    }

    pub async fn begin(&mut self) -> Result<()> {
        tracing::debug!(connection = %self.id, "begin transaction");
        self.backend.begin_transaction().await
    }

    pub async fn commit(&mut self) -> Result<()> {
        tracing::debug!(connection = %self.id, "commit transaction");
        self.backend.commit().await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        tracing::debug!(connection = %self.id, "rollback transaction");
        self.backend.rollback().await
    }

    pub fn in_transaction(&self) -> bool {
        self.backend.in_transaction()
    }

    /// Direct backend access for catalog introspection
    pub fn backend_mut(&mut self) -> &mut dyn DatabaseBackend {
        self.backend.as_mut()
    }

    pub fn log(&self) -> &StatementLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut StatementLog {
        &mut self.log
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("dialect", &self.dialect())
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

/// Named connections, one backend per id
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<String, Connection>,
    default_prefetch_limit: Option<usize>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every configured connection
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let mut registry = Self::new();
        registry.default_prefetch_limit = config.default_prefetch_limit;

        for (id, database) in &config.connections {
            let backend = connect(database).await?;
            tracing::info!(connection = %id, backend = database.backend_name(), "opened connection");
            registry.add_boxed(id.clone(), backend);
        }
        Ok(registry)
    }

    pub fn add<B: DatabaseBackend + 'static>(&mut self, id: impl Into<String>, backend: B) {
        self.add_boxed(id, Box::new(backend));
    }

    pub fn add_boxed(&mut self, id: impl Into<String>, backend: Box<dyn DatabaseBackend>) {
        let id = id.into();
        self.connections.insert(id.clone(), Connection::new(id, backend));
    }

    pub fn with_default_prefetch_limit(mut self, limit: Option<usize>) -> Self {
        self.default_prefetch_limit = limit;
        self
    }

    pub fn default_prefetch_limit(&self) -> Option<usize> {
        self.default_prefetch_limit
    }

    pub fn get(&self, id: &str) -> Result<&Connection> {
        self.connections
            .get(id)
            .ok_or_else(|| StoreError::UnknownConnection(id.to_string()))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut Connection> {
        self.connections
            .get_mut(id)
            .ok_or_else(|| StoreError::UnknownConnection(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Roll back anything left open and drop every connection
    pub async fn close(mut self) -> Result<()> {
        for connection in self.connections.values_mut() {
            if connection.in_transaction() {
                tracing::warn!(connection = %connection.id, "rolling back open transaction on close");
                connection.rollback().await?;
            }
        }
        Ok(())
    }
}

async fn connect(database: &DatabaseConfig) -> Result<Box<dyn DatabaseBackend>> {
    match database {
        #[cfg(feature = "sqlite")]
        DatabaseConfig::Sqlite { path } => {
            let backend = match path {
                Some(path) => crate::sqlite::SqliteBackend::file(path).await?,
                None => crate::sqlite::SqliteBackend::memory().await?,
            };
            Ok(Box::new(backend))
        }
        #[cfg(feature = "postgres")]
        DatabaseConfig::Postgres { url } => {
            Ok(Box::new(crate::postgres::PostgresBackend::new(url).await?))
        }
        #[allow(unreachable_patterns)]
        other => Err(StoreError::Config(format!(
            "backend {} is not compiled in",
            other.backend_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_kind() {
        assert_eq!(StatementKind::of("SELECT 1"), StatementKind::Select);
        assert_eq!(StatementKind::of("  insert INTO t"), StatementKind::Insert);
        assert_eq!(StatementKind::of("UPDATE \"t\" SET"), StatementKind::Update);
        assert_eq!(StatementKind::of("DELETE FROM t"), StatementKind::Delete);
        assert_eq!(StatementKind::of("CREATE TABLE t"), StatementKind::Other);
        assert_eq!(StatementKind::of(""), StatementKind::Other);
    }

    #[test]
    fn test_statement_log() {
        let mut log = StatementLog::default();
        log.record("SELECT 1");
        log.record("SELECT 2");
        log.record("UPDATE t SET a = 1");

        assert_eq!(log.count(StatementKind::Select), 2);
        assert_eq!(log.count(StatementKind::Update), 1);
        assert_eq!(log.count(StatementKind::Delete), 0);
        assert_eq!(log.total(), 3);
        assert_eq!(log.recent().last(), Some("UPDATE t SET a = 1"));

        for i in 0..100 {
            log.record(&format!("SELECT {}", i));
        }
        assert_eq!(log.recent().count(), RECENT_STATEMENTS);
        assert_eq!(log.recent().last(), Some("SELECT 99"));

        log.reset();
        assert_eq!(log.total(), 0);
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_open_from_config() {
        let mut registry = ConnectionRegistry::open(&StoreConfig::in_memory())
            .await
            .unwrap();
        assert_eq!(registry.ids(), vec!["default".to_string()]);

        let connection = registry.get_mut("default").unwrap();
        assert_eq!(connection.dialect(), Dialect::Sqlite);
        let rows = connection
            .fetch(&Statement::new("SELECT ? AS answer", vec![serde_json::json!(42)]))
            .await
            .unwrap();
        assert_eq!(rows[0].get_i64("answer"), Some(42));
        assert_eq!(connection.log().count(StatementKind::Select), 1);

        assert!(matches!(
            registry.get("archive"),
            Err(StoreError::UnknownConnection(_))
        ));
    }

    #[cfg(not(feature = "postgres"))]
    #[tokio::test]
    async fn test_missing_backend_is_config_error() {
        let config = StoreConfig::new().with_connection(
            "default",
            DatabaseConfig::Postgres {
                url: "postgres://localhost/db".to_string(),
            },
        );
        assert!(matches!(
            ConnectionRegistry::open(&config).await,
            Err(StoreError::Config(_))
        ));
    }
}
