use crate::array_store::ArrayStore;
use crate::backend::{QueryResult, QueryRow};
use crate::builder::{
    Condition, DeleteBuilder, InsertBuilder, OrderBy, SelectBuilder, SortDirection,
    Statement, UpdateBuilder,
};
use crate::connection::{Connection, ConnectionRegistry, StatementLog};
use crate::dialect::{Dialect, SqlType, TypeFamily};
use crate::entity::{Entity, EntityRef};
use crate::error::{Result, StoreError};
use crate::identity::IdentityMap;
use crate::schema::{
    EntitySchema, SchemaRegistry, ARRAY_TABLE, CREATED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN,
};
use crate::value;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

/// What a call to [`Session::store`] wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted(i64),
    /// Names of the updated columns
    Updated(Vec<String>),
    /// Nothing differed; no statement was issued
    Unchanged,
}

/// Condition, ordering and paging of a list query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    condition: Option<Condition>,
    order: Vec<OrderBy>,
    limit: Option<usize>,
    offset: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a SQL condition with `?` placeholders; values are always bound
    pub fn filter(self, sql: impl Into<String>, params: Vec<Value>) -> Self {
        self.and(Condition::raw(sql, params))
    }

    pub fn where_eq(self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.and(Condition::eq(column, value))
    }

    pub fn where_in(self, column: impl Into<String>, values: Vec<Value>) -> Self {
        self.and(Condition::is_in(column, values))
    }

    pub fn and(mut self, condition: Condition) -> Self {
        self.condition = Some(match self.condition {
            Some(existing) => existing.and(condition),
            None => condition,
        });
        self
    }

    pub fn order_asc(mut self, column: impl Into<String>) -> Self {
        self.order.push(OrderBy {
            column: column.into(),
            direction: SortDirection::Asc,
        });
        self
    }

    pub fn order_desc(mut self, column: impl Into<String>) -> Self {
        self.order.push(OrderBy {
            column: column.into(),
            direction: SortDirection::Desc,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }
}

/// Request-scoped unit of work.
///
/// Owns the connections and one identity map per connection for the lifetime of
/// a logical request. Entity handles are `Rc`s, so a session stays on one task.
/// Do not hold a `RefCell` borrow of an entity across a call into the session.
pub struct Session {
    registry: Arc<SchemaRegistry>,
    connections: ConnectionRegistry,
    identity: HashMap<String, IdentityMap>,
    pub(crate) arrays: ArrayStore,
}

impl Session {
    pub fn new(registry: Arc<SchemaRegistry>, connections: ConnectionRegistry) -> Result<Self> {
        registry.validate()?;
        for id in registry.connection_ids() {
            if !connections.contains(&id) {
                return Err(StoreError::UnknownConnection(id));
            }
        }

        let identity = connections
            .ids()
            .into_iter()
            .map(|id| (id, IdentityMap::new()))
            .collect();

        Ok(Self {
            registry,
            connections,
            identity,
            arrays: ArrayStore::default(),
        })
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn connections_mut(&mut self) -> &mut ConnectionRegistry {
        &mut self.connections
    }

    pub fn statement_log(&self, connection: &str) -> Result<&StatementLog> {
        Ok(self.connections.get(connection)?.log())
    }

    pub fn reset_statement_logs(&mut self) {
        for id in self.connections.ids() {
            if let Ok(connection) = self.connections.get_mut(&id) {
                connection.log_mut().reset();
            }
        }
    }

    pub fn identity_map(&self, connection: &str) -> Result<&IdentityMap> {
        self.identity
            .get(connection)
            .ok_or_else(|| StoreError::UnknownConnection(connection.to_string()))
    }

    fn identity_mut(&mut self, connection: &str) -> Result<&mut IdentityMap> {
        self.identity
            .get_mut(connection)
            .ok_or_else(|| StoreError::UnknownConnection(connection.to_string()))
    }

    pub(crate) fn mapped(&self, schema: &EntitySchema, id: i64) -> Option<EntityRef> {
        self.identity
            .get(schema.connection_id())
            .and_then(|map| map.get(schema.name(), id))
    }

    pub(crate) fn connection(&mut self, id: &str) -> Result<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Drop every cached instance and array value
    pub fn clear(&mut self) {
        for map in self.identity.values_mut() {
            map.clear();
        }
        self.arrays.clear();
    }

    /// End the request: roll back anything left open and hand the connections back
    pub async fn finish(mut self) -> Result<ConnectionRegistry> {
        self.clear();
        for id in self.connections.ids() {
            let connection = self.connections.get_mut(&id)?;
            if connection.in_transaction() {
                tracing::warn!(connection = %id, "rolling back transaction left open by request");
                connection.rollback().await?;
            }
        }
        Ok(self.connections)
    }

    /// New, unsaved instance with declared defaults
    pub fn create(&self, entity_type: &str) -> Result<EntityRef> {
        let schema = self.registry.get(entity_type)?;
        Ok(Rc::new(RefCell::new(Entity::new(schema))))
    }

    pub async fn begin(&mut self, connection: &str) -> Result<()> {
        self.connection(connection)?.begin().await
    }

    pub async fn commit(&mut self, connection: &str) -> Result<()> {
        self.connection(connection)?.commit().await
    }

    pub async fn rollback(&mut self, connection: &str) -> Result<()> {
        self.connection(connection)?.rollback().await
    }

    /// Select list of a row load: id, eager properties, timestamps
    pub(crate) fn select_list(schema: &EntitySchema, dialect: Dialect) -> Vec<String> {
        let mut columns = vec![dialect.select_expr(ID_COLUMN, &SqlType::new(TypeFamily::Integer))];
        columns.extend(
            schema
                .eager_properties()
                .map(|p| dialect.select_expr(&p.name, &SqlType::of(p))),
        );
        if schema.has_timestamps() {
            let timestamp = SqlType::new(TypeFamily::Timestamp);
            columns.push(dialect.select_expr(CREATED_AT_COLUMN, &timestamp));
            columns.push(dialect.select_expr(UPDATED_AT_COLUMN, &timestamp));
        }
        columns
    }

    /// Fetch rows of `schema` on its connection
    pub(crate) async fn fetch_rows(
        &mut self,
        schema: &EntitySchema,
        build: impl FnOnce(SelectBuilder) -> SelectBuilder,
    ) -> Result<QueryResult> {
        let connection = self.connection(schema.connection_id())?;
        let columns = Self::select_list(schema, connection.dialect());
        let statement = build(SelectBuilder::new(schema.table_name()).select(columns)).build()?;
        connection.fetch(&statement).await
    }

    /// Turn a row into the identity-mapped instance, refreshing a live one in place
    pub(crate) fn hydrate(&mut self, schema: &Arc<EntitySchema>, mut row: QueryRow) -> Result<EntityRef> {
        let id = row.get_i64(ID_COLUMN).ok_or_else(|| {
            StoreError::Database(format!("{} row without integer id", schema.name()))
        })?;

        let columns: HashMap<String, Value> = schema
            .eager_properties()
            .map(|p| (p.name.clone(), value::from_column(p, row.take(&p.name))))
            .collect();
        let created_at = timestamp(row.take(CREATED_AT_COLUMN));
        let updated_at = timestamp(row.take(UPDATED_AT_COLUMN));

        if let Some(existing) = self.mapped(schema, id) {
            existing
                .borrow_mut()
                .hydrate(id, columns, created_at, updated_at);
            return Ok(existing);
        }

        let mut entity = Entity::new(schema.clone());
        entity.reset_lazy();
        entity.hydrate(id, columns, created_at, updated_at);
        let entity = Rc::new(RefCell::new(entity));
        self.identity_mut(schema.connection_id())?
            .register(schema.name(), id, &entity)?;
        Ok(entity)
    }

    /// Load one instance; an identity map hit issues no query
    pub async fn load(&mut self, entity_type: &str, id: i64) -> Result<Option<EntityRef>> {
        let schema = self.registry.get(entity_type)?;
        if let Some(entity) = self.mapped(&schema, id) {
            return Ok(Some(entity));
        }

        let rows = self
            .fetch_rows(&schema, |select| select.where_eq(ID_COLUMN, id).limit(1))
            .await?;
        match rows.into_iter().next() {
            Some(row) => Ok(Some(self.hydrate(&schema, row)?)),
            None => Ok(None),
        }
    }

    /// Load several instances with one query for the ids not already mapped.
    ///
    /// Results follow the order of `ids`; missing rows are skipped.
    pub async fn load_many(&mut self, entity_type: &str, ids: &[i64]) -> Result<Vec<EntityRef>> {
        let schema = self.registry.get(entity_type)?;

        let mut seen = HashSet::new();
        let missing: Vec<Value> = ids
            .iter()
            .filter(|id| seen.insert(**id) && self.mapped(&schema, **id).is_none())
            .map(|id| Value::from(*id))
            .collect();

        if !missing.is_empty() {
            let rows = self
                .fetch_rows(&schema, |select| select.where_in(ID_COLUMN, missing))
                .await?;
            for row in rows {
                self.hydrate(&schema, row)?;
            }
        }

        let batch: Vec<EntityRef> = ids
            .iter()
            .filter_map(|id| self.mapped(&schema, *id))
            .collect();
        self.prefetch(&schema, &batch).await?;
        Ok(batch)
    }

    /// Run a list query and hydrate every row through the identity map
    pub async fn query(&mut self, entity_type: &str, query: &Query) -> Result<Vec<EntityRef>> {
        let schema = self.registry.get(entity_type)?;
        check_query(&schema, query)?;
        let dialect = self.connection(schema.connection_id())?.dialect();
        let condition = typed_condition(&schema, dialect, query);

        let rows = self
            .fetch_rows(&schema, |mut select| {
                if let Some(condition) = condition {
                    select = select.where_clause(condition);
                }
                for order in &query.order {
                    select = select.order_by(order.column.clone(), order.direction);
                }
                if let Some(limit) = query.limit {
                    select = select.limit(limit);
                }
                if let Some(offset) = query.offset {
                    select = select.offset(offset);
                }
                select
            })
            .await?;

        let mut batch = Vec::with_capacity(rows.len());
        for row in rows {
            batch.push(self.hydrate(&schema, row)?);
        }
        self.prefetch(&schema, &batch).await?;
        Ok(batch)
    }

    pub async fn query_one(&mut self, entity_type: &str, query: &Query) -> Result<Option<EntityRef>> {
        let query = query.clone().limit(1);
        Ok(self.query(entity_type, &query).await?.into_iter().next())
    }

    pub async fn count(&mut self, entity_type: &str, query: &Query) -> Result<i64> {
        let schema = self.registry.get(entity_type)?;
        check_query(&schema, query)?;
        let connection = self.connection(schema.connection_id())?;

        let mut select = SelectBuilder::new(schema.table_name()).count();
        if let Some(condition) = typed_condition(&schema, connection.dialect(), query) {
            select = select.where_clause(condition);
        }
        let statement = select.build()?;
        let rows = connection.fetch(&statement).await?;
        Ok(rows.first().and_then(|row| row.get_i64("count")).unwrap_or(0))
    }

    /// Read a property, fetching a lazy column on first access
    pub async fn get(&mut self, entity: &EntityRef, property: &str) -> Result<Value> {
        let pending = {
            let e = entity.borrow();
            let definition = e
                .schema()
                .property_def(property)
                .ok_or_else(|| StoreError::unknown_property(e.type_name(), property))?
                .clone();
            match e.id() {
                Some(id) if e.needs_lazy_load(property) => Some((e.schema().clone(), definition, id)),
                _ => None,
            }
        };

        if let Some((schema, definition, id)) = pending {
            let connection = self.connection(schema.connection_id())?;
            let dialect = connection.dialect();
            let statement = SelectBuilder::new(schema.table_name())
                .select(vec![dialect.select_expr(&definition.name, &SqlType::of(&definition))])
                .where_eq(ID_COLUMN, id)
                .limit(1)
                .build()?;
            let rows = connection.fetch(&statement).await?;
            let fetched = rows
                .into_iter()
                .next()
                .map(|mut row| value::from_column(&definition, row.take(&definition.name)))
                .unwrap_or(Value::Null);
            entity.borrow_mut().load_lazy(property, fetched);
        }

        let value = entity.borrow().get(property)?.clone();
        Ok(value)
    }

    /// Resolve a reference property to its live instance.
    ///
    /// A null reference and an id without a row both resolve to `None`.
    pub async fn reference(&mut self, entity: &EntityRef, property: &str) -> Result<Option<EntityRef>> {
        let (target, id) = {
            let e = entity.borrow();
            let definition = e
                .schema()
                .property_def(property)
                .ok_or_else(|| StoreError::unknown_property(e.type_name(), property))?;
            let target = definition
                .reference_target()
                .ok_or_else(|| StoreError::InvalidValue {
                    entity: e.type_name().to_string(),
                    property: property.to_string(),
                    reason: "not a reference property".to_string(),
                })?
                .to_string();
            (target, e.reference_id(property)?)
        };

        match id {
            Some(id) => self.load(&target, id).await,
            None => Ok(None),
        }
    }

    /// Insert a new instance or write its changed columns, then run `after_store`
    pub async fn store(&mut self, entity: &EntityRef) -> Result<StoreOutcome> {
        let schema = entity.borrow().schema().clone();
        let hooks = self.registry.hooks(schema.name());
        {
            let e = entity.borrow();
            check_required(&e)?;
            hooks.validate(&e)?;
        }

        let id = entity.borrow().id();
        let outcome = match id {
            None => self.insert_entity(&schema, entity).await?,
            Some(id) => self.update_entity(&schema, id, entity).await?,
        };

        hooks.after_store(self, entity).await?;
        Ok(outcome)
    }

    async fn insert_entity(&mut self, schema: &Arc<EntitySchema>, entity: &EntityRef) -> Result<StoreOutcome> {
        let connection = self.connection(schema.connection_id())?;
        let dialect = connection.dialect();
        let now = value::now_timestamp();

        let (statement, written) = {
            let e = entity.borrow();
            let mut insert = InsertBuilder::new(schema.table_name());
            let mut row = Vec::with_capacity(schema.properties().len() + 2);
            let mut written = Vec::with_capacity(schema.properties().len());
            for property in schema.properties() {
                insert = insert.column(&property.name, dialect.param_expr(&SqlType::of(property)));
                row.push(value::to_param(property, e.value_or_null(&property.name)));
                written.push(property.name.clone());
            }
            if schema.has_timestamps() {
                let expr = dialect.param_expr(&SqlType::new(TypeFamily::Timestamp));
                insert = insert
                    .column(CREATED_AT_COLUMN, expr)
                    .column(UPDATED_AT_COLUMN, expr);
                row.push(Value::from(now.as_str()));
                row.push(Value::from(now.as_str()));
            }
            if !written.is_empty() || schema.has_timestamps() {
                insert = insert.row(row);
            }
            (insert.build()?, written)
        };

        let id = connection.insert(&statement).await?;
        entity.borrow_mut().mark_stored(id, &written, Some(&now));
        self.identity_mut(schema.connection_id())?
            .register(schema.name(), id, entity)?;
        Ok(StoreOutcome::Inserted(id))
    }

    async fn update_entity(
        &mut self,
        schema: &Arc<EntitySchema>,
        id: i64,
        entity: &EntityRef,
    ) -> Result<StoreOutcome> {
        let changed = entity.borrow().changed_properties();
        if changed.is_empty() {
            return Ok(StoreOutcome::Unchanged);
        }

        let connection = self.connection(schema.connection_id())?;
        let dialect = connection.dialect();
        let now = value::now_timestamp();

        let statement = {
            let e = entity.borrow();
            let mut update = UpdateBuilder::new(schema.table_name());
            for name in &changed {
                let property = schema
                    .property_def(name)
                    .ok_or_else(|| StoreError::unknown_property(schema.name(), name))?;
                update = update.set_with(
                    name.clone(),
                    dialect.param_expr(&SqlType::of(property)),
                    value::to_param(property, e.value_or_null(name)),
                );
            }
            if schema.has_timestamps() {
                update = update.set_with(
                    UPDATED_AT_COLUMN,
                    dialect.param_expr(&SqlType::new(TypeFamily::Timestamp)),
                    now.as_str(),
                );
            }
            update.where_eq(ID_COLUMN, id).build()?
        };

        if connection.execute(&statement).await? == 0 {
            tracing::warn!(entity = schema.name(), id, "update matched no row");
            self.identity_mut(schema.connection_id())?
                .evict(schema.name(), id);
            self.arrays.forget_owner(schema.name(), id);
            entity.borrow_mut().mark_deleted();
            return Err(StoreError::RowVanished {
                entity: schema.name().to_string(),
                id,
            });
        }
        entity.borrow_mut().mark_stored(id, &changed, Some(&now));
        Ok(StoreOutcome::Updated(changed))
    }

    /// Delete a stored instance together with its array values.
    ///
    /// A new instance is a no-op; afterwards the handle is new again.
    pub async fn delete(&mut self, entity: &EntityRef) -> Result<()> {
        let (schema, id) = {
            let e = entity.borrow();
            (e.schema().clone(), e.id())
        };
        let Some(id) = id else {
            return Ok(());
        };

        let hooks = self.registry.hooks(schema.name());
        if !hooks.is_deletable(&entity.borrow()) {
            tracing::warn!(entity = schema.name(), id, "delete refused by entity");
            return Err(StoreError::NotDeletable {
                entity: schema.name().to_string(),
                id,
            });
        }

        let delete_row = DeleteBuilder::new(schema.table_name())
            .where_eq(ID_COLUMN, id)
            .build()?;
        let delete_arrays = DeleteBuilder::new(ARRAY_TABLE)
            .where_eq("owner_type", schema.name())
            .where_eq("owner_id", id)
            .build()?;

        let connection = self.connection(schema.connection_id())?;
        let owns_tx = !connection.in_transaction();
        if owns_tx {
            connection.begin().await?;
        }

        let result = async {
            connection.execute(&delete_row).await?;
            connection.execute(&delete_arrays).await?;
            Ok::<_, StoreError>(())
        }
        .await;

        match result {
            Ok(()) => {
                if owns_tx {
                    connection.commit().await?;
                }
            }
            Err(e) => {
                if owns_tx {
                    connection.rollback().await?;
                }
                return Err(e);
            }
        }

        self.identity_mut(schema.connection_id())?
            .evict(schema.name(), id);
        self.arrays.forget_owner(schema.name(), id);
        entity.borrow_mut().mark_deleted();
        Ok(())
    }

    /// Run statements on one connection as a unit, joining an open transaction
    pub(crate) async fn run_unit(&mut self, connection: &str, statements: &[Statement]) -> Result<()> {
        let connection = self.connection(connection)?;
        let owns_tx = !connection.in_transaction();
        if owns_tx {
            connection.begin().await?;
        }

        let result = async {
            for statement in statements {
                connection.execute(statement).await?;
            }
            Ok::<_, StoreError>(())
        }
        .await;

        match result {
            Ok(()) => {
                if owns_tx {
                    connection.commit().await?;
                }
                Ok(())
            }
            Err(e) => {
                if owns_tx {
                    connection.rollback().await?;
                }
                Err(e)
            }
        }
    }
}

fn timestamp(raw: Value) -> Option<String> {
    match raw {
        Value::String(s) => Some(s.get(..19).unwrap_or(s.as_str()).replace('T', " ")),
        _ => None,
    }
}

fn check_required(entity: &Entity) -> Result<()> {
    for property in entity.schema().properties() {
        if property.nullable || entity.needs_lazy_load(&property.name) {
            continue;
        }
        if entity.value_or_null(&property.name).is_null() {
            return Err(StoreError::Validation(format!(
                "{}.{} is required",
                entity.type_name(),
                property.name
            )));
        }
    }
    Ok(())
}

/// Column type used to bind comparison parameters
fn column_type(schema: &EntitySchema, column: &str) -> SqlType {
    match column {
        ID_COLUMN => SqlType::new(TypeFamily::Integer),
        CREATED_AT_COLUMN | UPDATED_AT_COLUMN => SqlType::new(TypeFamily::Timestamp),
        _ => schema
            .property_def(column)
            .map(SqlType::of)
            .unwrap_or_else(|| SqlType::new(TypeFamily::Text)),
    }
}

/// The query's condition with every simple comparison bound as its column's type
fn typed_condition(schema: &EntitySchema, dialect: Dialect, query: &Query) -> Option<Condition> {
    query.condition.clone().map(|condition| {
        condition.with_placeholders(&|column: &str| dialect.param_expr(&column_type(schema, column)))
    })
}

fn check_query(schema: &EntitySchema, query: &Query) -> Result<()> {
    let known = schema.column_names();
    let check = |column: &str| -> Result<()> {
        if known.contains(&column) {
            Ok(())
        } else {
            Err(StoreError::unknown_property(schema.name(), column))
        }
    };

    for order in &query.order {
        check(&order.column)?;
    }

    let mut pending: Vec<&Condition> = query.condition.iter().collect();
    while let Some(condition) = pending.pop() {
        match condition {
            Condition::Simple { column, .. } => check(column)?,
            Condition::Compound { conditions, .. } => pending.extend(conditions.iter()),
            Condition::Raw { .. } => {}
        }
    }
    Ok(())
}
