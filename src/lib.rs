//! tx2-storable - Object-Relational Persistence for TX-2 Applications
//!
//! tx2-storable maps declaratively described entity types onto relational
//! tables and back, keeping exactly one live instance per stored row within a
//! request.
//!
//! # Architecture
//!
//! - **Schema Descriptors**: `EntitySchema` declares properties, indexes and
//!   the connection a type lives on; the `SchemaRegistry` is built once
//! - **Connections**: named connections, each a single database session
//! - **Session**: request-scoped unit of work owning the identity maps
//! - **Lazy Columns**: large columns stay out of row loads until first read
//! - **Prefetching**: references of a loaded batch are fetched with one query
//!   per target type
//! - **Array Side-Table**: ordered lists of scalars per owner and name
//! - **Schema Differ**: introspects live databases and proposes safe and
//!   unsafe DDL, never running anything destructive by itself
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tx2_storable::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let mut registry = SchemaRegistry::new();
//!     registry.register(
//!         EntitySchema::new("Customer")
//!             .property(PropertyDef::text("name").length(80).required())
//!             .property(PropertyDef::text("notes").lazy()),
//!     )?;
//!     registry.register(
//!         EntitySchema::new("Order")
//!             .property(PropertyDef::reference("customer", "Customer"))
//!             .property(PropertyDef::float("net").length(14).decimals(2))
//!             .index(IndexDef::index(&["customer"])),
//!     )?;
//!
//!     let mut connections = ConnectionRegistry::open(&StoreConfig::in_memory()).await?;
//!
//!     // Bring the database in line with the registry
//!     let plan = SchemaDiffer::new(&registry).diff(&mut connections).await?;
//!     execute_queries(&mut connections, plan.safe_queries()).await?;
//!
//!     let mut session = Session::new(Arc::new(registry), connections)?;
//!     let customer = session.create("Customer")?;
//!     customer.borrow_mut().set("name", "Ada")?;
//!     session.store(&customer).await?;
//!
//!     let orders = session
//!         .query("Order", &Query::new().where_eq("customer", 1).order_desc("net"))
//!         .await?;
//!     for order in &orders {
//!         if let Some(customer) = session.reference(order, "customer").await? {
//!             println!("{:?}", customer.borrow().get_str("name")?);
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Backend Support
//!
//! Enable backends via Cargo features:
//!
//! ```toml
//! [dependencies]
//! tx2-storable = { version = "0.1", features = ["postgres", "sqlite"] }
//! ```

pub mod array_store;
pub mod backend;
pub mod builder;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod identity;
pub mod migrate;
pub mod prefetch;
pub mod schema;
pub mod session;
pub mod value;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use array_store::ArrayStore;
pub use backend::{ColumnInfo, DatabaseBackend, IndexInfo, QueryResult, QueryRow};
pub use builder::{
    ComparisonOp, Condition, DeleteBuilder, InsertBuilder, LogicalOp, SelectBuilder,
    SortDirection, Statement, UpdateBuilder,
};
pub use config::{DatabaseConfig, StoreConfig};
pub use connection::{Connection, ConnectionRegistry, StatementKind, StatementLog};
pub use dialect::{Dialect, SqlType, TypeFamily};
pub use entity::{DefaultHooks, Entity, EntityHooks, EntityRef};
pub use error::{Result, StoreError};
pub use identity::IdentityMap;
pub use migrate::{
    execute_queries, DatabaseSnapshot, MigrationKind, MigrationPlan, MigrationQuery,
    SchemaDiffer, TableSnapshot,
};
pub use schema::{
    ColumnType, EntitySchema, IndexDef, IndexKind, PropertyDef, PropertyOverride, SchemaRegistry,
};
pub use session::{Query, Session, StoreOutcome};

#[cfg(feature = "postgres")]
pub use postgres::PostgresBackend;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::{DatabaseConfig, StoreConfig};
    pub use crate::connection::ConnectionRegistry;
    pub use crate::entity::{Entity, EntityHooks, EntityRef};
    pub use crate::error::{Result, StoreError};
    pub use crate::migrate::{execute_queries, MigrationPlan, SchemaDiffer};
    pub use crate::schema::{
        ColumnType, EntitySchema, IndexDef, PropertyDef, PropertyOverride, SchemaRegistry,
    };
    pub use crate::session::{Query, Session, StoreOutcome};

    #[cfg(feature = "postgres")]
    pub use crate::postgres::PostgresBackend;

    #[cfg(feature = "sqlite")]
    pub use crate::sqlite::SqliteBackend;
}
