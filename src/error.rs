use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("{entity} #{id} is not deletable")]
    NotDeletable { entity: String, id: i64 },

    #[error("Schema introspection failed: {0}")]
    SchemaIntrospection(String),

    #[error("Programmer error: {0}")]
    Programmer(String),

    #[error("Entity type not registered: {0}")]
    UnknownEntity(String),

    #[error("Property {property} is not declared on {entity}")]
    UnknownProperty { entity: String, property: String },

    #[error("Connection not registered: {0}")]
    UnknownConnection(String),

    #[error("Invalid value for {entity}.{property}: {reason}")]
    InvalidValue {
        entity: String,
        property: String,
        reason: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Lazy property {entity}.{property} has not been fetched")]
    LazyNotLoaded { entity: String, property: String },

    #[error("{0} has not been stored yet")]
    NotPersisted(String),

    #[error("{entity} #{id} no longer exists")]
    RowVanished { entity: String, id: i64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StoreError {
    /// Errors that terminate the request instead of being handled by the caller.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::SchemaIntrospection(_)
                | StoreError::Programmer(_)
                | StoreError::UnknownEntity(_)
                | StoreError::UnknownProperty { .. }
        )
    }

    pub(crate) fn unknown_property(entity: &str, property: &str) -> Self {
        StoreError::UnknownProperty {
            entity: entity.to_string(),
            property: property.to_string(),
        }
    }
}

#[cfg(any(feature = "sqlite", feature = "postgres"))]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err)
                if db_err.is_unique_violation() || db_err.is_foreign_key_violation() =>
            {
                StoreError::ConstraintViolation(db_err.message().to_string())
            }
            sqlx::Error::Database(db_err) => StoreError::Database(db_err.message().to_string()),
            sqlx::Error::Io(io) => StoreError::Io(io),
            sqlx::Error::Configuration(cfg) => StoreError::Connection(cfg.to_string()),
            sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
                StoreError::Connection("connection is closed".to_string())
            }
            other => StoreError::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(StoreError::SchemaIntrospection("no catalog".into()).is_fatal());
        assert!(StoreError::Programmer("bad override".into()).is_fatal());
        assert!(StoreError::unknown_property("Invoice", "nett").is_fatal());
        assert!(!StoreError::ConstraintViolation("unique".into()).is_fatal());
        assert!(!StoreError::NotDeletable {
            entity: "Invoice".into(),
            id: 1
        }
        .is_fatal());
    }

    #[test]
    fn test_messages() {
        let err = StoreError::NotDeletable {
            entity: "Invoice".into(),
            id: 7,
        };
        assert_eq!(err.to_string(), "Invoice #7 is not deletable");

        let err = StoreError::unknown_property("Invoice", "nett");
        assert_eq!(err.to_string(), "Property nett is not declared on Invoice");

        let err = StoreError::RowVanished {
            entity: "Invoice".into(),
            id: 3,
        };
        assert_eq!(err.to_string(), "Invoice #3 no longer exists");
        assert!(!err.is_fatal());
    }
}
