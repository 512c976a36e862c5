use crate::backend::{ColumnInfo, DatabaseBackend, IndexInfo};
use crate::connection::ConnectionRegistry;
use crate::dialect::{defaults_match, zero_value, Dialect, SqlType};
use crate::error::{Result, StoreError};
use crate::schema::{
    EntitySchema, IndexDef, PropertyDef, SchemaRegistry, CREATED_AT_COLUMN, ID_COLUMN,
    UPDATED_AT_COLUMN,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// What a migration query does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MigrationKind {
    CreateTable,
    CreateIndex,
    AddColumn,
    AlterColumn,
    RenameColumn,
    PrimaryKey,
    DropIndex,
    DropColumn,
    DropTable,
}

/// One DDL unit; may hold several `;`-separated statements
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationQuery {
    pub connection: String,
    pub table: String,
    pub kind: MigrationKind,
    /// Unsafe queries can lose data or fail on existing rows
    pub safe: bool,
    pub description: String,
    pub sql: String,
}

impl fmt::Display for MigrationQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.connection, self.description)
    }
}

/// Safe and unsafe queries computed from one snapshot.
///
/// Running one batch changes the database the other was computed against;
/// diff again before running the second.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationPlan {
    safe: Vec<MigrationQuery>,
    unsafe_queries: Vec<MigrationQuery>,
}

impl MigrationPlan {
    pub fn safe_queries(&self) -> &[MigrationQuery] {
        &self.safe
    }

    pub fn unsafe_queries(&self) -> &[MigrationQuery] {
        &self.unsafe_queries
    }

    pub fn is_empty(&self) -> bool {
        self.safe.is_empty() && self.unsafe_queries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.safe.len() + self.unsafe_queries.len()
    }

    fn extend(&mut self, other: MigrationPlan) {
        self.safe.extend(other.safe);
        self.unsafe_queries.extend(other.unsafe_queries);
    }
}

/// Live tables of one connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSnapshot {
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
}

impl TableSnapshot {
    fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatabaseSnapshot {
    pub tables: BTreeMap<String, TableSnapshot>,
}

impl DatabaseSnapshot {
    /// Read tables, columns and secondary indexes from the catalog
    pub async fn capture(backend: &mut dyn DatabaseBackend) -> Result<Self> {
        let mut tables = BTreeMap::new();
        for table in backend.list_tables().await? {
            let columns = backend.table_columns(&table).await?;
            let indexes = backend.table_indexes(&table).await?;
            tables.insert(table, TableSnapshot { columns, indexes });
        }
        Ok(Self { tables })
    }
}

/// Queries grouped in execution order
#[derive(Default)]
struct Buckets {
    create_tables: Vec<MigrationQuery>,
    add_columns: Vec<MigrationQuery>,
    safe_alters: Vec<MigrationQuery>,
    create_indexes: Vec<MigrationQuery>,
    drop_indexes: Vec<MigrationQuery>,
    renames: Vec<MigrationQuery>,
    primary_keys: Vec<MigrationQuery>,
    unsafe_alters: Vec<MigrationQuery>,
    drop_columns: Vec<MigrationQuery>,
    drop_tables: Vec<MigrationQuery>,
}

impl Buckets {
    fn into_plan(self) -> MigrationPlan {
        let safe = [
            self.create_tables,
            self.add_columns,
            self.safe_alters,
            self.create_indexes,
        ]
        .concat();
        let unsafe_queries = [
            self.drop_indexes,
            self.renames,
            self.primary_keys,
            self.unsafe_alters,
            self.drop_columns,
            self.drop_tables,
        ]
        .concat();
        MigrationPlan {
            safe,
            unsafe_queries,
        }
    }
}

/// How a live column differs from its declaration
#[derive(Debug, Default)]
struct ColumnChange {
    type_changed: bool,
    /// New nullability, when it changes
    nullable: Option<bool>,
    default_changed: bool,
    safe: bool,
    notes: Vec<String>,
}

/// `Some(true)` widens, `Some(false)` narrows; `None` limits are unbounded
fn limit_change(live: Option<u32>, declared: Option<u32>) -> Option<bool> {
    match (live, declared) {
        (a, b) if a == b => None,
        (Some(_), None) => Some(true),
        (None, Some(_)) => Some(false),
        (Some(a), Some(b)) => Some(b > a),
        _ => None,
    }
}

fn limit_text(limit: Option<u32>) -> String {
    limit.map_or_else(|| "unbounded".to_string(), |n| n.to_string())
}

fn compare_column(dialect: Dialect, property: &PropertyDef, live: &ColumnInfo) -> Option<ColumnChange> {
    let declared_type = SqlType::of(property);
    let live_type = dialect.parse_type(&live.type_name);
    let mut change = ColumnChange {
        safe: true,
        ..ColumnChange::default()
    };

    if declared_type.family != live_type.family {
        change.type_changed = true;
        change.safe = false;
        change
            .notes
            .push(format!("type {} -> {}", live_type, declared_type));
    } else {
        if let Some(widens) = limit_change(live_type.length, declared_type.length) {
            change.type_changed = true;
            change.safe &= widens;
            change.notes.push(format!(
                "length {} -> {}",
                limit_text(live_type.length),
                limit_text(declared_type.length)
            ));
        }
        if let Some(widens) = limit_change(live_type.decimals, declared_type.decimals) {
            change.type_changed = true;
            change.safe &= widens;
            change.notes.push(format!(
                "decimals {} -> {}",
                limit_text(live_type.decimals),
                limit_text(declared_type.decimals)
            ));
        }
    }

    if property.nullable && live.not_null {
        change.nullable = Some(true);
        change.notes.push("drop NOT NULL".to_string());
    } else if !property.nullable && !live.not_null {
        change.nullable = Some(false);
        change.safe = false;
        change.notes.push("set NOT NULL".to_string());
    }

    if let Some(default) = &property.default {
        let rendered = dialect.render_default(property, default);
        let matches = live
            .default_value
            .as_deref()
            .is_some_and(|live| defaults_match(&rendered, live));
        if !matches {
            change.default_changed = true;
            change.notes.push(format!("default {}", rendered));
        }
    }

    if change.notes.is_empty() {
        None
    } else {
        Some(change)
    }
}

/// Declared physical columns of a table, id excluded
fn declared_columns(schema: &EntitySchema) -> Vec<PropertyDef> {
    let mut columns = schema.properties().to_vec();
    if schema.has_timestamps() {
        columns.push(PropertyDef::timestamp(CREATED_AT_COLUMN));
        columns.push(PropertyDef::timestamp(UPDATED_AT_COLUMN));
    }
    columns
}

/// Value written into rows that are NULL in a column becoming NOT NULL
fn backfill_literal(dialect: Dialect, property: &PropertyDef) -> String {
    let value = match &property.default {
        Some(value) => value.clone(),
        None => zero_value(&SqlType::of(property).family),
    };
    dialect.render_default(property, &value)
}

/// Compares registered schemas against live databases
pub struct SchemaDiffer<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> SchemaDiffer<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Introspect every connection the registry uses, then diff them.
    ///
    /// Any introspection failure aborts before a single query is produced.
    pub async fn diff(&self, connections: &mut ConnectionRegistry) -> Result<MigrationPlan> {
        let mut snapshots = Vec::new();
        for id in self.registry.connection_ids() {
            let connection = connections.get_mut(&id)?;
            let dialect = connection.dialect();
            let snapshot = DatabaseSnapshot::capture(connection.backend_mut())
                .await
                .map_err(|err| {
                    tracing::error!(connection = %id, error = %err, "schema introspection failed");
                    StoreError::SchemaIntrospection(format!("connection {}: {}", id, err))
                })?;
            snapshots.push((id, dialect, snapshot));
        }

        let mut plan = MigrationPlan::default();
        for (id, dialect, snapshot) in &snapshots {
            plan.extend(self.diff_snapshot(id, *dialect, snapshot));
        }
        Ok(plan)
    }

    /// Diff one connection's snapshot without touching the database
    pub fn diff_snapshot(
        &self,
        connection: &str,
        dialect: Dialect,
        snapshot: &DatabaseSnapshot,
    ) -> MigrationPlan {
        let schemas = self.registry.schemas_for_connection(connection);
        let mut buckets = Buckets::default();

        for schema in &schemas {
            let differ = TableDiffer {
                connection,
                dialect,
                schema,
            };
            match snapshot.tables.get(schema.table_name()) {
                None => differ.create(&mut buckets),
                Some(live) => differ.diff(live, &mut buckets),
            }
        }

        let declared: HashSet<&str> = schemas.iter().map(|s| s.table_name()).collect();
        for table in snapshot.tables.keys() {
            if !declared.contains(table.as_str()) {
                buckets.drop_tables.push(MigrationQuery {
                    connection: connection.to_string(),
                    table: table.clone(),
                    kind: MigrationKind::DropTable,
                    safe: false,
                    description: format!("drop undeclared table {}", table),
                    sql: dialect.drop_table_sql(table),
                });
            }
        }

        buckets.into_plan()
    }
}

struct TableDiffer<'s> {
    connection: &'s str,
    dialect: Dialect,
    schema: &'s EntitySchema,
}

impl<'s> TableDiffer<'s> {
    fn table(&self) -> &str {
        self.schema.table_name()
    }

    fn query(&self, kind: MigrationKind, safe: bool, description: String, sql: String) -> MigrationQuery {
        MigrationQuery {
            connection: self.connection.to_string(),
            table: self.table().to_string(),
            kind,
            safe,
            description,
            sql,
        }
    }

    fn create(&self, buckets: &mut Buckets) {
        buckets.create_tables.push(self.query(
            MigrationKind::CreateTable,
            true,
            format!("create table {}", self.table()),
            self.dialect.create_table_sql(self.schema),
        ));
        for index in self.schema.indexes() {
            buckets.create_tables.push(self.create_index(index));
        }
    }

    fn create_index(&self, index: &IndexDef) -> MigrationQuery {
        self.query(
            MigrationKind::CreateIndex,
            true,
            format!("create index {}", index.name(self.table())),
            self.dialect.create_index_sql(self.table(), index),
        )
    }

    fn diff(&self, live: &TableSnapshot, buckets: &mut Buckets) {
        let table = self.table();
        let declared = declared_columns(self.schema);
        let declared_names: HashSet<&str> = declared.iter().map(|p| p.name.as_str()).collect();

        let mut added: Vec<&PropertyDef> = Vec::new();
        let mut renamed: HashMap<&str, &PropertyDef> = HashMap::new();
        let mut safe_changes: Vec<(&PropertyDef, ColumnChange)> = Vec::new();
        let mut unsafe_changes: Vec<(&PropertyDef, ColumnChange)> = Vec::new();

        for property in &declared {
            match live.column(&property.name) {
                Some(column) => {
                    if let Some(change) = compare_column(self.dialect, property, column) {
                        if change.safe {
                            safe_changes.push((property, change));
                        } else {
                            unsafe_changes.push((property, change));
                        }
                    }
                }
                None => {
                    let old = property.renamed_from.as_deref().filter(|old| {
                        live.column(old).is_some() && !declared_names.contains(old)
                    });
                    match old {
                        Some(old) => {
                            renamed.insert(old, property);
                        }
                        None => added.push(property),
                    }
                }
            }
        }

        for property in &added {
            buckets.add_columns.push(self.query(
                MigrationKind::AddColumn,
                true,
                format!("add column {}.{}", table, property.name),
                self.dialect.add_column_sql(table, property),
            ));
        }

        let mut renames: Vec<(&str, &PropertyDef)> = renamed.iter().map(|(o, p)| (*o, *p)).collect();
        renames.sort_by_key(|(old, _)| *old);
        for (old, property) in renames {
            buckets.renames.push(self.query(
                MigrationKind::RenameColumn,
                false,
                format!("rename column {}.{} to {}", table, old, property.name),
                self.dialect.rename_column_sql(table, old, &property.name),
            ));
        }

        let primary_key_missing = live.column(ID_COLUMN).map_or(true, |c| !c.primary_key);

        match self.dialect {
            Dialect::Sqlite => {
                if !safe_changes.is_empty() {
                    buckets.safe_alters.push(self.query(
                        MigrationKind::AlterColumn,
                        true,
                        format!("rebuild {}: {}", table, describe(&safe_changes)),
                        self.sqlite_rebuild(live, &safe_changes, &HashMap::new(), true),
                    ));
                }
                if primary_key_missing || !unsafe_changes.is_empty() {
                    let mut notes = Vec::new();
                    if primary_key_missing {
                        notes.push(format!("primary key {}", ID_COLUMN));
                    }
                    if !unsafe_changes.is_empty() {
                        notes.push(describe(&unsafe_changes));
                    }
                    let (kind, bucket) = if primary_key_missing {
                        (MigrationKind::PrimaryKey, &mut buckets.primary_keys)
                    } else {
                        (MigrationKind::AlterColumn, &mut buckets.unsafe_alters)
                    };
                    bucket.push(self.query(
                        kind,
                        false,
                        format!("rebuild {}: {}", table, notes.join("; ")),
                        self.sqlite_rebuild(live, &unsafe_changes, &renamed, false),
                    ));
                }
            }
            Dialect::Postgres => {
                if primary_key_missing {
                    buckets.primary_keys.push(self.query(
                        MigrationKind::PrimaryKey,
                        false,
                        format!("primary key {}.{}", table, ID_COLUMN),
                        self.postgres_primary_key(live),
                    ));
                }
                for (property, change) in &safe_changes {
                    buckets.safe_alters.push(self.postgres_alter(property, change));
                }
                for (property, change) in &unsafe_changes {
                    buckets.unsafe_alters.push(self.postgres_alter(property, change));
                }
            }
        }

        for column in &live.columns {
            let name = column.name.as_str();
            if name == ID_COLUMN || declared_names.contains(name) || renamed.contains_key(name) {
                continue;
            }
            buckets.drop_columns.push(self.query(
                MigrationKind::DropColumn,
                false,
                format!("drop undeclared column {}.{}", table, name),
                self.dialect.drop_column_sql(table, name),
            ));
        }

        let declared_indexes: HashMap<String, &IndexDef> = self
            .schema
            .indexes()
            .iter()
            .map(|index| (index.name(table), index))
            .collect();
        let live_indexes: HashSet<&str> = live.indexes.iter().map(|i| i.name.as_str()).collect();

        for index in self.schema.indexes() {
            if !live_indexes.contains(index.name(table).as_str()) {
                buckets.create_indexes.push(self.create_index(index));
            }
        }
        for index in &live.indexes {
            if !declared_indexes.contains_key(&index.name) {
                buckets.drop_indexes.push(self.query(
                    MigrationKind::DropIndex,
                    false,
                    format!("drop undeclared index {}", index.name),
                    self.dialect.drop_index_sql(&index.name),
                ));
            }
        }
    }

    fn postgres_alter(&self, property: &PropertyDef, change: &ColumnChange) -> MigrationQuery {
        let dialect = self.dialect;
        let table = dialect.quote_ident(self.table());
        let column = dialect.quote_ident(&property.name);
        let mut statements = Vec::new();
        let mut actions = Vec::new();

        if change.type_changed {
            let rendered = dialect.render_type(&SqlType::of(property));
            actions.push(format!(
                "ALTER COLUMN {} TYPE {} USING {}::{}",
                column, rendered, column, rendered
            ));
        }
        match change.nullable {
            Some(true) => actions.push(format!("ALTER COLUMN {} DROP NOT NULL", column)),
            Some(false) => {
                statements.push(format!(
                    "UPDATE {} SET {} = {} WHERE {} IS NULL",
                    table,
                    column,
                    backfill_literal(dialect, property),
                    column
                ));
                actions.push(format!("ALTER COLUMN {} SET NOT NULL", column));
            }
            None => {}
        }
        if change.default_changed {
            if let Some(default) = &property.default {
                actions.push(format!(
                    "ALTER COLUMN {} SET DEFAULT {}",
                    column,
                    dialect.render_default(property, default)
                ));
            }
        }
        statements.push(format!("ALTER TABLE {} {}", table, actions.join(", ")));

        self.query(
            MigrationKind::AlterColumn,
            change.safe,
            format!(
                "alter column {}.{}: {}",
                self.table(),
                property.name,
                change.notes.join(", ")
            ),
            join_script(&statements),
        )
    }

    fn postgres_primary_key(&self, live: &TableSnapshot) -> String {
        let dialect = self.dialect;
        let table = dialect.quote_ident(self.table());
        let constraint = dialect.quote_ident(&format!("{}_pkey", self.table()));
        let drop = format!("ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}", table, constraint);
        let add = match live.column(ID_COLUMN) {
            Some(_) => format!(
                "ALTER TABLE {} ADD PRIMARY KEY ({})",
                table,
                dialect.quote_ident(ID_COLUMN)
            ),
            None => format!("ALTER TABLE {} ADD COLUMN {}", table, dialect.primary_key_column()),
        };
        join_script(&[drop, add])
    }

    /// SQLite cannot alter a column in place: copy through a shadow table.
    ///
    /// Columns without a change keep their live definition, undeclared ones
    /// included. `with_added` carries columns added earlier in the same batch.
    fn sqlite_rebuild(
        &self,
        live: &TableSnapshot,
        changes: &[(&PropertyDef, ColumnChange)],
        renamed: &HashMap<&str, &PropertyDef>,
        with_added: bool,
    ) -> String {
        let dialect = self.dialect;
        let table = self.table();
        let shadow = format!("{}__rebuild", table);
        let changed: HashMap<&str, &ColumnChange> = changes
            .iter()
            .map(|(property, change)| (property.name.as_str(), change))
            .collect();

        let mut definitions = vec![dialect.primary_key_column()];
        let mut targets = Vec::new();
        let mut sources = Vec::new();
        if live.column(ID_COLUMN).is_some() {
            targets.push(dialect.quote_ident(ID_COLUMN));
            sources.push(dialect.quote_ident(ID_COLUMN));
        }

        let declared = declared_columns(self.schema);
        let find = |name: &str| declared.iter().find(|p| p.name == name);

        for column in &live.columns {
            if column.name == ID_COLUMN {
                continue;
            }
            let name = renamed
                .get(column.name.as_str())
                .map_or(column.name.as_str(), |p| p.name.as_str());
            let quoted = dialect.quote_ident(name);

            match (changed.get(name), find(name)) {
                (Some(change), Some(property)) => {
                    definitions.push(dialect.column_definition(property));
                    sources.push(if change.nullable == Some(false) {
                        format!("COALESCE({}, {})", quoted, backfill_literal(dialect, property))
                    } else {
                        quoted.clone()
                    });
                }
                _ => {
                    definitions.push(live_definition(dialect, name, column));
                    sources.push(quoted.clone());
                }
            }
            targets.push(quoted);
        }

        if with_added {
            for property in &declared {
                let exists = live.column(&property.name).is_some()
                    || renamed.values().any(|p| p.name == property.name);
                let is_rename_target = property
                    .renamed_from
                    .as_deref()
                    .is_some_and(|old| live.column(old).is_some());
                if exists || is_rename_target {
                    continue;
                }
                let quoted = dialect.quote_ident(&property.name);
                definitions.push(dialect.add_column_definition(property));
                targets.push(quoted.clone());
                sources.push(quoted);
            }
        }

        let mut statements = vec![
            format!(
                "CREATE TABLE {} (\n  {}\n)",
                dialect.quote_ident(&shadow),
                definitions.join(",\n  ")
            ),
            format!(
                "INSERT INTO {} ({}) SELECT {} FROM {}",
                dialect.quote_ident(&shadow),
                targets.join(", "),
                sources.join(", "),
                dialect.quote_ident(table)
            ),
            dialect.drop_table_sql(table),
            format!(
                "ALTER TABLE {} RENAME TO {}",
                dialect.quote_ident(&shadow),
                dialect.quote_ident(table)
            ),
        ];

        // The unsafe batch drops undeclared indexes before rebuilding.
        for index in &live.indexes {
            let declared = self
                .schema
                .indexes()
                .iter()
                .find(|i| i.name(table) == index.name);
            match (declared, &index.sql, with_added) {
                (Some(declared), _, false) => {
                    statements.push(dialect.create_index_sql(table, declared))
                }
                (_, Some(sql), true) => statements.push(sql.clone()),
                (Some(declared), None, true) => {
                    statements.push(dialect.create_index_sql(table, declared))
                }
                _ => {}
            }
        }

        join_script(&statements)
    }
}

fn live_definition(dialect: Dialect, name: &str, column: &ColumnInfo) -> String {
    let mut definition = dialect.quote_ident(name);
    if !column.type_name.is_empty() {
        definition.push(' ');
        definition.push_str(&column.type_name);
    }
    if column.not_null {
        definition.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default_value {
        definition.push_str(" DEFAULT ");
        definition.push_str(default);
    }
    definition
}

fn describe(changes: &[(&PropertyDef, ColumnChange)]) -> String {
    changes
        .iter()
        .map(|(property, change)| format!("{} ({})", property.name, change.notes.join(", ")))
        .collect::<Vec<_>>()
        .join("; ")
}

fn join_script(statements: &[String]) -> String {
    statements
        .iter()
        .map(|s| format!("{};", s))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Run migration queries in order, each in its own transaction.
///
/// Returns the number of queries applied; stops at the first failure.
pub async fn execute_queries(
    connections: &mut ConnectionRegistry,
    queries: &[MigrationQuery],
) -> Result<usize> {
    let mut applied = 0;
    for query in queries {
        let connection = connections.get_mut(&query.connection)?;
        let owns_tx = !connection.in_transaction();
        if owns_tx {
            connection.begin().await?;
        }

        match connection.execute_script(&query.sql).await {
            Ok(()) => {
                if owns_tx {
                    connection.commit().await?;
                }
                tracing::info!(
                    connection = %query.connection,
                    kind = ?query.kind,
                    safe = query.safe,
                    "applied migration: {}",
                    query.description
                );
                applied += 1;
            }
            Err(e) => {
                if owns_tx {
                    connection.rollback().await?;
                }
                tracing::error!(connection = %query.connection, error = %e, "migration failed: {}", query.description);
                return Err(e);
            }
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::QueryResult;
    use crate::schema::{EntitySchema, IndexDef, ARRAY_TABLE};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn registry() -> SchemaRegistry {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::new("Invoice")
                    .property(PropertyDef::text("number").length(20).required())
                    .property(PropertyDef::float("net").length(14).decimals(2))
                    .property(PropertyDef::boolean("paid").required().default_value(false))
                    .index(IndexDef::unique(&["number"])),
            )
            .unwrap();
        registry
    }

    /// Snapshot of a database created from the registry's own DDL
    fn snapshot_of(registry: &SchemaRegistry, dialect: Dialect) -> DatabaseSnapshot {
        let mut snapshot = DatabaseSnapshot::default();
        for schema in registry.schemas_for_connection("default") {
            let mut columns = vec![ColumnInfo {
                cid: 0,
                name: ID_COLUMN.to_string(),
                type_name: "INTEGER".to_string(),
                not_null: false,
                default_value: None,
                primary_key: true,
            }];
            for (i, property) in declared_columns(&schema).iter().enumerate() {
                columns.push(ColumnInfo {
                    cid: i as i64 + 1,
                    name: property.name.clone(),
                    type_name: dialect.render_type(&SqlType::of(property)),
                    not_null: !property.nullable,
                    default_value: property
                        .default
                        .as_ref()
                        .map(|d| dialect.render_default(property, d)),
                    primary_key: false,
                });
            }
            let indexes = schema
                .indexes()
                .iter()
                .map(|index| IndexInfo {
                    name: index.name(schema.table_name()),
                    unique: false,
                    columns: index.columns.clone(),
                    sql: Some(dialect.create_index_sql(schema.table_name(), index)),
                })
                .collect();
            snapshot
                .tables
                .insert(schema.table_name().to_string(), TableSnapshot { columns, indexes });
        }
        snapshot
    }

    fn column_mut<'a>(snapshot: &'a mut DatabaseSnapshot, table: &str, column: &str) -> &'a mut ColumnInfo {
        snapshot
            .tables
            .get_mut(table)
            .unwrap()
            .columns
            .iter_mut()
            .find(|c| c.name == column)
            .unwrap()
    }

    fn kinds(queries: &[MigrationQuery]) -> Vec<MigrationKind> {
        queries.iter().map(|q| q.kind).collect()
    }

    #[test]
    fn test_empty_database_creates_everything() {
        let registry = registry();
        let plan = SchemaDiffer::new(&registry).diff_snapshot(
            "default",
            Dialect::Sqlite,
            &DatabaseSnapshot::default(),
        );

        assert!(plan.unsafe_queries().is_empty());
        let tables: Vec<&str> = plan
            .safe_queries()
            .iter()
            .filter(|q| q.kind == MigrationKind::CreateTable)
            .map(|q| q.table.as_str())
            .collect();
        assert_eq!(tables, vec!["Invoice", ARRAY_TABLE]);

        // Each table is immediately followed by its indexes
        let invoice = plan
            .safe_queries()
            .iter()
            .position(|q| q.table == "Invoice" && q.kind == MigrationKind::CreateTable)
            .unwrap();
        assert_eq!(plan.safe_queries()[invoice + 1].kind, MigrationKind::CreateIndex);
        assert!(plan.safe_queries()[invoice + 1]
            .sql
            .starts_with("CREATE UNIQUE INDEX \"Invoice_unique_number\""));
    }

    #[test]
    fn test_matching_snapshot_is_empty() {
        let registry = registry();
        for dialect in [Dialect::Sqlite, Dialect::Postgres] {
            let snapshot = snapshot_of(&registry, dialect);
            let plan = SchemaDiffer::new(&registry).diff_snapshot("default", dialect, &snapshot);
            assert!(plan.is_empty(), "{:?}: {:?}", dialect, plan);
        }
    }

    #[test]
    fn test_widening_is_safe_narrowing_is_not() {
        let registry = registry();
        let differ = SchemaDiffer::new(&registry);

        let mut snapshot = snapshot_of(&registry, Dialect::Postgres);
        column_mut(&mut snapshot, "Invoice", "number").type_name = "character varying(10)".into();
        let plan = differ.diff_snapshot("default", Dialect::Postgres, &snapshot);
        assert_eq!(kinds(plan.safe_queries()), vec![MigrationKind::AlterColumn]);
        assert!(plan.unsafe_queries().is_empty());
        assert!(plan.safe_queries()[0]
            .sql
            .contains("ALTER COLUMN \"number\" TYPE VARCHAR(20) USING \"number\"::VARCHAR(20)"));

        let mut snapshot = snapshot_of(&registry, Dialect::Postgres);
        column_mut(&mut snapshot, "Invoice", "number").type_name = "character varying(40)".into();
        let plan = differ.diff_snapshot("default", Dialect::Postgres, &snapshot);
        assert!(plan.safe_queries().is_empty());
        assert_eq!(kinds(plan.unsafe_queries()), vec![MigrationKind::AlterColumn]);

        let mut snapshot = snapshot_of(&registry, Dialect::Postgres);
        column_mut(&mut snapshot, "Invoice", "net").type_name = "numeric(14,4)".into();
        let plan = differ.diff_snapshot("default", Dialect::Postgres, &snapshot);
        assert_eq!(plan.unsafe_queries().len(), 1);
        assert!(plan.unsafe_queries()[0].description.contains("decimals 4 -> 2"));
    }

    #[test]
    fn test_nullability_and_type_family() {
        let registry = registry();
        let differ = SchemaDiffer::new(&registry);

        let mut snapshot = snapshot_of(&registry, Dialect::Postgres);
        column_mut(&mut snapshot, "Invoice", "net").not_null = true;
        let plan = differ.diff_snapshot("default", Dialect::Postgres, &snapshot);
        assert_eq!(plan.safe_queries().len(), 1);
        assert!(plan.safe_queries()[0].sql.contains("DROP NOT NULL"));

        let mut snapshot = snapshot_of(&registry, Dialect::Postgres);
        column_mut(&mut snapshot, "Invoice", "number").not_null = false;
        let plan = differ.diff_snapshot("default", Dialect::Postgres, &snapshot);
        assert_eq!(plan.unsafe_queries().len(), 1);
        let sql = &plan.unsafe_queries()[0].sql;
        assert!(sql.starts_with("UPDATE \"Invoice\" SET \"number\" = '' WHERE \"number\" IS NULL;"));
        assert!(sql.contains("SET NOT NULL"));

        let mut snapshot = snapshot_of(&registry, Dialect::Postgres);
        column_mut(&mut snapshot, "Invoice", "paid").type_name = "text".into();
        let plan = differ.diff_snapshot("default", Dialect::Postgres, &snapshot);
        assert_eq!(plan.unsafe_queries().len(), 1);
        assert!(plan.unsafe_queries()[0].description.contains("type Text -> Boolean"));
    }

    #[test]
    fn test_default_changes_are_safe() {
        let registry = registry();
        let differ = SchemaDiffer::new(&registry);

        let mut snapshot = snapshot_of(&registry, Dialect::Postgres);
        column_mut(&mut snapshot, "Invoice", "paid").default_value = None;
        let plan = differ.diff_snapshot("default", Dialect::Postgres, &snapshot);
        assert_eq!(plan.safe_queries().len(), 1);
        assert!(plan.safe_queries()[0].sql.contains("SET DEFAULT FALSE"));

        // Catalog spelling of the same default
        let mut snapshot = snapshot_of(&registry, Dialect::Postgres);
        column_mut(&mut snapshot, "Invoice", "paid").default_value = Some("false".into());
        let plan = differ.diff_snapshot("default", Dialect::Postgres, &snapshot);
        assert!(plan.is_empty());
    }

    #[test]
    fn test_undeclared_objects_are_unsafe_drops() {
        let registry = registry();
        let mut snapshot = snapshot_of(&registry, Dialect::Sqlite);
        {
            let invoice = snapshot.tables.get_mut("Invoice").unwrap();
            invoice.columns.push(ColumnInfo {
                cid: 9,
                name: "legacy".into(),
                type_name: "TEXT".into(),
                not_null: false,
                default_value: None,
                primary_key: false,
            });
            invoice.indexes.push(IndexInfo {
                name: "Invoice_idx_legacy".into(),
                unique: false,
                columns: vec!["legacy".into()],
                sql: None,
            });
            invoice.indexes.retain(|i| i.name != "Invoice_unique_number");
        }
        snapshot
            .tables
            .insert("old_audit".into(), TableSnapshot::default());

        let plan = SchemaDiffer::new(&registry).diff_snapshot("default", Dialect::Sqlite, &snapshot);
        assert_eq!(kinds(plan.safe_queries()), vec![MigrationKind::CreateIndex]);
        assert_eq!(
            kinds(plan.unsafe_queries()),
            vec![
                MigrationKind::DropIndex,
                MigrationKind::DropColumn,
                MigrationKind::DropTable
            ]
        );
        assert_eq!(plan.unsafe_queries()[0].sql, "DROP INDEX \"Invoice_idx_legacy\"");
        assert_eq!(
            plan.unsafe_queries()[1].sql,
            "ALTER TABLE \"Invoice\" DROP COLUMN \"legacy\""
        );
        assert!(plan.unsafe_queries().iter().all(|q| !q.safe));
    }

    #[test]
    fn test_renamed_column() {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::new("Customer")
                    .property(PropertyDef::text("full_name").renamed_from("name")),
            )
            .unwrap();

        let mut snapshot = snapshot_of(&registry, Dialect::Postgres);
        column_mut(&mut snapshot, "Customer", "full_name").name = "name".into();

        let plan = SchemaDiffer::new(&registry).diff_snapshot("default", Dialect::Postgres, &snapshot);
        assert!(plan.safe_queries().is_empty());
        assert_eq!(kinds(plan.unsafe_queries()), vec![MigrationKind::RenameColumn]);
        assert_eq!(
            plan.unsafe_queries()[0].sql,
            "ALTER TABLE \"Customer\" RENAME COLUMN \"name\" TO \"full_name\""
        );
    }

    #[test]
    fn test_missing_primary_key() {
        let registry = registry();

        let mut snapshot = snapshot_of(&registry, Dialect::Postgres);
        column_mut(&mut snapshot, "Invoice", ID_COLUMN).primary_key = false;
        let plan = SchemaDiffer::new(&registry).diff_snapshot("default", Dialect::Postgres, &snapshot);
        assert_eq!(kinds(plan.unsafe_queries()), vec![MigrationKind::PrimaryKey]);
        assert!(plan.unsafe_queries()[0].sql.ends_with("ADD PRIMARY KEY (\"id\");"));

        let mut snapshot = snapshot_of(&registry, Dialect::Sqlite);
        snapshot
            .tables
            .get_mut("Invoice")
            .unwrap()
            .columns
            .retain(|c| c.name != ID_COLUMN);
        let plan = SchemaDiffer::new(&registry).diff_snapshot("default", Dialect::Sqlite, &snapshot);
        assert_eq!(kinds(plan.unsafe_queries()), vec![MigrationKind::PrimaryKey]);
        let sql = &plan.unsafe_queries()[0].sql;
        assert!(sql.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(sql.contains("INSERT INTO \"Invoice__rebuild\" (\"number\""));
        assert!(sql.contains("CREATE UNIQUE INDEX \"Invoice_unique_number\""));
    }

    #[test]
    fn test_sqlite_rebuild_keeps_other_columns() {
        let registry = registry();
        let mut snapshot = snapshot_of(&registry, Dialect::Sqlite);
        column_mut(&mut snapshot, "Invoice", "number").type_name = "VARCHAR(10)".into();

        let plan = SchemaDiffer::new(&registry).diff_snapshot("default", Dialect::Sqlite, &snapshot);
        assert_eq!(kinds(plan.safe_queries()), vec![MigrationKind::AlterColumn]);
        let sql = &plan.safe_queries()[0].sql;
        assert!(sql.contains("\"number\" VARCHAR(20) NOT NULL"));
        assert!(sql.contains("\"net\" DECIMAL(14,2)"));
        assert!(sql.contains("DROP TABLE \"Invoice\";"));
        assert!(sql.contains("ALTER TABLE \"Invoice__rebuild\" RENAME TO \"Invoice\";"));
    }

    #[derive(Default)]
    struct FailingCatalog {
        executed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DatabaseBackend for FailingCatalog {
        async fn connect(_url: &str) -> Result<Self> {
            Ok(Self::default())
        }

        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        async fn execute_with(&mut self, _sql: &str, _params: &[Value]) -> Result<u64> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }

        async fn execute_script(&mut self, _sql: &str) -> Result<()> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn query_with(&mut self, _sql: &str, _params: &[Value]) -> Result<QueryResult> {
            Ok(Vec::new())
        }

        async fn insert(&mut self, _sql: &str, _params: &[Value]) -> Result<i64> {
            Ok(0)
        }

        async fn begin_transaction(&mut self) -> Result<()> {
            Ok(())
        }

        async fn commit(&mut self) -> Result<()> {
            Ok(())
        }

        async fn rollback(&mut self) -> Result<()> {
            Ok(())
        }

        fn in_transaction(&self) -> bool {
            false
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn list_tables(&mut self) -> Result<Vec<String>> {
            Ok(vec!["Invoice".to_string()])
        }

        async fn table_columns(&mut self, _table: &str) -> Result<Vec<ColumnInfo>> {
            Err(StoreError::Database("permission denied for catalog".to_string()))
        }

        async fn table_indexes(&mut self, _table: &str) -> Result<Vec<IndexInfo>> {
            Ok(Vec::new())
        }

        async fn close(self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_introspection_failure_aborts() {
        let registry = registry();
        let backend = FailingCatalog::default();
        let executed = backend.executed.clone();
        let mut connections = ConnectionRegistry::new();
        connections.add("default", backend);

        let err = SchemaDiffer::new(&registry)
            .diff(&mut connections)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SchemaIntrospection(_)));
        assert!(err.is_fatal());
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }
}
