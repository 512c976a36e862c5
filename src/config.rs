use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::schema::DEFAULT_CONNECTION;

const DEFAULT_CONFIG_NAME: &str = "storable.json";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum DatabaseConfig {
    /// Embedded database file; `None` opens a private in-memory database
    Sqlite { path: Option<String> },
    Postgres { url: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Connection id -> backend
    pub connections: BTreeMap<String, DatabaseConfig>,
    /// Prefetch cap for reference properties that declare none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_prefetch_limit: Option<usize>,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self {
            connections: BTreeMap::new(),
            default_prefetch_limit: None,
        }
    }

    /// Single default connection backed by a SQLite file
    pub fn default_sqlite(path: impl Into<String>) -> Self {
        Self::new().with_connection(
            DEFAULT_CONNECTION,
            DatabaseConfig::Sqlite {
                path: Some(path.into()),
            },
        )
    }

    /// Single default connection backed by an in-memory SQLite database
    pub fn in_memory() -> Self {
        Self::new().with_connection(DEFAULT_CONNECTION, DatabaseConfig::Sqlite { path: None })
    }

    pub fn with_connection(mut self, id: impl Into<String>, database: DatabaseConfig) -> Self {
        self.connections.insert(id.into(), database);
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| StoreError::Config(format!("read {}: {err}", path.display())))?;
        let config: StoreConfig = serde_json::from_str(&raw)
            .map_err(|err| StoreError::Config(format!("parse {}: {err}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_or_init(base_dir: &Path, default_sqlite_path: &Path) -> Result<Self> {
        fs::create_dir_all(base_dir)
            .map_err(|err| StoreError::Config(format!("create config dir: {err}")))?;
        let config_path = base_dir.join(DEFAULT_CONFIG_NAME);
        if config_path.exists() {
            return Self::load(&config_path);
        }
        let default = StoreConfig::default_sqlite(default_sqlite_path.to_string_lossy());
        let payload = serde_json::to_string_pretty(&default)?;
        fs::write(&config_path, payload)?;
        tracing::info!(path = %config_path.display(), "wrote default store config");
        Ok(default)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connections.is_empty() {
            return Err(StoreError::Config("no connections configured".to_string()));
        }
        for (id, database) in &self.connections {
            if let DatabaseConfig::Postgres { url } = database {
                if url.trim().is_empty() {
                    return Err(StoreError::Config(format!("connection {id}: empty url")));
                }
            }
        }
        Ok(())
    }

    pub fn database(&self, id: &str) -> Result<&DatabaseConfig> {
        self.connections
            .get(id)
            .ok_or_else(|| StoreError::UnknownConnection(id.to_string()))
    }

    /// Resolve a SQLite connection's file against `base_dir`; `None` for in-memory
    pub fn sqlite_path(&self, id: &str, base_dir: &Path) -> Result<Option<PathBuf>> {
        match self.database(id)? {
            DatabaseConfig::Sqlite { path: None } => Ok(None),
            DatabaseConfig::Sqlite { path: Some(path) } => {
                let candidate = PathBuf::from(path);
                if candidate.is_absolute() {
                    Ok(Some(candidate))
                } else {
                    Ok(Some(base_dir.join(candidate)))
                }
            }
            DatabaseConfig::Postgres { .. } => Err(StoreError::Config(format!(
                "connection {id} is not a sqlite backend"
            ))),
        }
    }

    pub fn backend_name(&self, id: &str) -> Result<&'static str> {
        Ok(self.database(id)?.backend_name())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DatabaseConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            DatabaseConfig::Sqlite { .. } => "sqlite",
            DatabaseConfig::Postgres { .. } => "postgres",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_shape() {
        let config = StoreConfig::in_memory().with_connection(
            "reporting",
            DatabaseConfig::Postgres {
                url: "postgres://localhost/reports".to_string(),
            },
        );
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["connections"]["default"]["backend"], "sqlite");
        assert_eq!(json["connections"]["reporting"]["backend"], "postgres");
        assert!(json.get("default_prefetch_limit").is_none());

        let parsed: StoreConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.backend_name("reporting").unwrap(), "postgres");
    }

    #[test]
    fn test_load_or_init_writes_default() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("app.sqlite");

        let first = StoreConfig::load_or_init(dir.path(), &db).unwrap();
        assert!(dir.path().join(DEFAULT_CONFIG_NAME).exists());

        let second = StoreConfig::load_or_init(dir.path(), &db).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            second.sqlite_path(DEFAULT_CONNECTION, dir.path()).unwrap(),
            Some(db)
        );
    }

    #[test]
    fn test_relative_sqlite_path() {
        let config = StoreConfig::default_sqlite("data/app.sqlite");
        let base = Path::new("/srv/app");
        assert_eq!(
            config.sqlite_path(DEFAULT_CONNECTION, base).unwrap(),
            Some(PathBuf::from("/srv/app/data/app.sqlite"))
        );
        assert!(matches!(
            config.sqlite_path("missing", base),
            Err(StoreError::UnknownConnection(_))
        ));
    }

    #[test]
    fn test_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_NAME);

        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(StoreConfig::load(&path), Err(StoreError::Config(_))));

        fs::write(&path, r#"{"connections": {}}"#).unwrap();
        assert!(matches!(StoreConfig::load(&path), Err(StoreError::Config(_))));
    }
}
