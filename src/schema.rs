use crate::dialect::Dialect;
use crate::entity::{DefaultHooks, EntityHooks};
use crate::error::{Result, StoreError};
use crate::value;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// Connection id used by entity types that do not name one.
pub const DEFAULT_CONNECTION: &str = "default";

/// Shared side-table holding array values, one per connection.
pub const ARRAY_TABLE: &str = "storable_array";

/// Columns every table carries besides the declared properties.
pub const ID_COLUMN: &str = "id";
pub const CREATED_AT_COLUMN: &str = "created_at";
pub const UPDATED_AT_COLUMN: &str = "updated_at";

const RESERVED_PROPERTIES: [&str; 3] = [ID_COLUMN, CREATED_AT_COLUMN, UPDATED_AT_COLUMN];

/// PostgreSQL truncates longer identifiers.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Precision used for decimal floats declared without a length.
const DEFAULT_DECIMAL_PRECISION: u32 = 18;

/// Semantic type of a property
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Float,
    Boolean,
    Text,
    Timestamp,
    Date,
    Time,
    Json,
    /// Primary key of another entity type
    Reference(String),
}

impl ColumnType {
    pub fn name(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Text => "text",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Date => "date",
            ColumnType::Time => "time",
            ColumnType::Json => "json",
            ColumnType::Reference(_) => "reference",
        }
    }

    pub fn reference_target(&self) -> Option<&str> {
        match self {
            ColumnType::Reference(target) => Some(target),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Reference(target) => write!(f, "reference({})", target),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// Property (column) definition
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyDef {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub length: Option<u32>,
    pub decimals: Option<u32>,
    pub default: Option<Value>,
    pub lazy_fetch: bool,
    pub prefetch_enabled: bool,
    pub prefetch_limit: Option<usize>,
    pub renamed_from: Option<String>,
}

impl PropertyDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            length: None,
            decimals: None,
            default: None,
            lazy_fetch: false,
            prefetch_enabled: true,
            prefetch_limit: None,
            renamed_from: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Boolean)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Timestamp)
    }

    pub fn date(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Date)
    }

    pub fn time(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Time)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Json)
    }

    pub fn reference(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, ColumnType::Reference(target.into()))
    }

    /// Mark the column NOT NULL
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn decimals(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Fetch the column only when it is first read
    pub fn lazy(mut self) -> Self {
        self.lazy_fetch = true;
        self
    }

    /// Resolve this reference one access at a time instead of per batch
    pub fn no_prefetch(mut self) -> Self {
        self.prefetch_enabled = false;
        self
    }

    pub fn prefetch_limit(mut self, limit: usize) -> Self {
        self.prefetch_limit = Some(limit);
        self
    }

    /// Previous column name, migrated with a rename instead of drop + add
    pub fn renamed_from(mut self, old_name: impl Into<String>) -> Self {
        self.renamed_from = Some(old_name.into());
        self
    }

    pub fn is_reference(&self) -> bool {
        matches!(self.column_type, ColumnType::Reference(_))
    }

    pub fn reference_target(&self) -> Option<&str> {
        self.column_type.reference_target()
    }
}

/// Index kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Index,
    Unique,
    Fulltext,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Index => "idx",
            IndexKind::Unique => "unique",
            IndexKind::Fulltext => "fulltext",
        }
    }
}

/// Index definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    pub columns: Vec<String>,
    pub kind: IndexKind,
}

impl IndexDef {
    pub fn new(kind: IndexKind, columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            kind,
        }
    }

    pub fn index(columns: &[&str]) -> Self {
        Self::new(IndexKind::Index, columns)
    }

    pub fn unique(columns: &[&str]) -> Self {
        Self::new(IndexKind::Unique, columns)
    }

    pub fn fulltext(columns: &[&str]) -> Self {
        Self::new(IndexKind::Fulltext, columns)
    }

    /// Deterministic index name; the differ matches live indexes by it.
    ///
    /// Names longer than PostgreSQL's identifier limit keep a prefix and end
    /// in a digest of the full name.
    pub fn name(&self, table: &str) -> String {
        let full = format!("{}_{}_{}", table, self.kind.as_str(), self.columns.join("_"));
        if full.len() <= MAX_IDENTIFIER_LEN {
            return full;
        }

        let digest = Sha256::digest(full.as_bytes());
        let suffix: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
        let mut cut = MAX_IDENTIFIER_LEN - suffix.len() - 1;
        while !full.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}_{}", &full[..cut], suffix)
    }
}

/// Explicit per-property overrides supplied by the entity author
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyOverride {
    pub property: String,
    pub column_type: Option<ColumnType>,
    pub nullable: Option<bool>,
    pub length: Option<u32>,
    pub decimals: Option<u32>,
    pub default: Option<Value>,
    pub lazy_fetch: Option<bool>,
    pub prefetch_enabled: Option<bool>,
    pub prefetch_limit: Option<usize>,
}

impl PropertyOverride {
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            ..Default::default()
        }
    }

    pub fn column_type(mut self, column_type: ColumnType) -> Self {
        self.column_type = Some(column_type);
        self
    }

    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = Some(nullable);
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn decimals(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy_fetch = Some(lazy);
        self
    }

    pub fn prefetch(mut self, enabled: bool) -> Self {
        self.prefetch_enabled = Some(enabled);
        self
    }

    pub fn prefetch_limit(mut self, limit: usize) -> Self {
        self.prefetch_limit = Some(limit);
        self
    }

    fn apply(&self, def: &mut PropertyDef) {
        if let Some(column_type) = &self.column_type {
            def.column_type = column_type.clone();
        }
        if let Some(nullable) = self.nullable {
            def.nullable = nullable;
        }
        if let Some(length) = self.length {
            def.length = Some(length);
        }
        if let Some(decimals) = self.decimals {
            def.decimals = Some(decimals);
        }
        if let Some(default) = &self.default {
            def.default = Some(default.clone());
        }
        if let Some(lazy) = self.lazy_fetch {
            def.lazy_fetch = lazy;
        }
        if let Some(enabled) = self.prefetch_enabled {
            def.prefetch_enabled = enabled;
        }
        if let Some(limit) = self.prefetch_limit {
            def.prefetch_limit = Some(limit);
        }
    }
}

/// Declarative description of one entity type and its table
#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: String,
    connection: String,
    properties: Vec<PropertyDef>,
    positions: HashMap<String, usize>,
    indexes: Vec<IndexDef>,
    overrides: Vec<PropertyOverride>,
    timestamps: bool,
    system: bool,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection: DEFAULT_CONNECTION.to_string(),
            properties: Vec::new(),
            positions: HashMap::new(),
            indexes: Vec::new(),
            overrides: Vec::new(),
            timestamps: true,
            system: false,
        }
    }

    /// Bind the type to a named connection
    pub fn connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    pub fn index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    pub fn override_property(mut self, property_override: PropertyOverride) -> Self {
        self.overrides.push(property_override);
        self
    }

    /// Merge a shared base descriptor in front of this type's own declarations.
    pub fn extend(mut self, base: &EntitySchema) -> Self {
        let mut properties = base.properties.clone();
        properties.append(&mut self.properties);
        self.properties = properties;

        let mut indexes = base.indexes.clone();
        indexes.append(&mut self.indexes);
        self.indexes = indexes;

        let mut overrides = base.overrides.clone();
        overrides.append(&mut self.overrides);
        self.overrides = overrides;
        self
    }

    /// Skip the created_at / updated_at columns
    pub fn without_timestamps(mut self) -> Self {
        self.timestamps = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_name(&self) -> &str {
        &self.name
    }

    pub fn connection_id(&self) -> &str {
        &self.connection
    }

    pub fn properties(&self) -> &[PropertyDef] {
        &self.properties
    }

    pub fn property_def(&self, name: &str) -> Option<&PropertyDef> {
        self.positions.get(name).map(|&i| &self.properties[i])
    }

    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    pub fn has_timestamps(&self) -> bool {
        self.timestamps
    }

    pub fn is_system(&self) -> bool {
        self.system
    }

    /// Properties fetched with the row
    pub fn eager_properties(&self) -> impl Iterator<Item = &PropertyDef> {
        self.properties.iter().filter(|p| !p.lazy_fetch)
    }

    pub fn lazy_properties(&self) -> impl Iterator<Item = &PropertyDef> {
        self.properties.iter().filter(|p| p.lazy_fetch)
    }

    pub fn references(&self) -> impl Iterator<Item = &PropertyDef> {
        self.properties.iter().filter(|p| p.is_reference())
    }

    /// Names of all physical columns, system columns included
    pub fn column_names(&self) -> Vec<&str> {
        let mut columns = vec![ID_COLUMN];
        columns.extend(self.properties.iter().map(|p| p.name.as_str()));
        if self.timestamps {
            columns.push(CREATED_AT_COLUMN);
            columns.push(UPDATED_AT_COLUMN);
        }
        columns
    }

    fn has_column(&self, name: &str) -> bool {
        self.positions.contains_key(name)
            || name == ID_COLUMN
            || (self.timestamps && (name == CREATED_AT_COLUMN || name == UPDATED_AT_COLUMN))
    }

    /// Apply overrides and check the declaration; every failure is a programmer error.
    fn finalize(mut self) -> Result<Self> {
        check_identifier("entity type", &self.name)?;
        check_identifier("connection id", &self.connection)?;

        let mut positions = HashMap::new();
        for (i, property) in self.properties.iter().enumerate() {
            check_identifier("property", &property.name)?;
            if RESERVED_PROPERTIES.contains(&property.name.as_str()) {
                return Err(programmer(format!(
                    "{}.{} uses a reserved column name",
                    self.name, property.name
                )));
            }
            if positions.insert(property.name.clone(), i).is_some() {
                return Err(programmer(format!(
                    "{}.{} is declared twice",
                    self.name, property.name
                )));
            }
        }

        for property_override in &self.overrides {
            let position = positions.get(&property_override.property).ok_or_else(|| {
                programmer(format!(
                    "override on {} names undeclared property {}",
                    self.name, property_override.property
                ))
            })?;
            property_override.apply(&mut self.properties[*position]);
        }
        self.overrides.clear();

        for property in &mut self.properties {
            normalize_property(&self.name, property)?;
        }

        self.positions = positions;

        let mut index_names = HashSet::new();
        for index in &self.indexes {
            if index.columns.is_empty() {
                return Err(programmer(format!("index on {} has no columns", self.name)));
            }
            for column in &index.columns {
                if !self.has_column(column) {
                    return Err(programmer(format!(
                        "index on {} names undeclared property {}",
                        self.name, column
                    )));
                }
            }
            if !index_names.insert(index.name(&self.name)) {
                return Err(programmer(format!(
                    "index {} is declared twice",
                    index.name(&self.name)
                )));
            }
        }

        Ok(self)
    }
}

fn normalize_property(entity: &str, property: &mut PropertyDef) -> Result<()> {
    if property.length == Some(0) {
        return Err(programmer(format!("{}.{} has zero length", entity, property.name)));
    }
    match &property.column_type {
        ColumnType::Float => {
            if property.decimals.is_some() && property.length.is_none() {
                property.length = Some(DEFAULT_DECIMAL_PRECISION);
            }
            if property.length.is_some() && property.decimals.is_none() {
                property.decimals = Some(0);
            }
            if let (Some(length), Some(decimals)) = (property.length, property.decimals) {
                if decimals > length {
                    return Err(programmer(format!(
                        "{}.{} has more decimals than digits",
                        entity, property.name
                    )));
                }
            }
        }
        ColumnType::Text => {
            if property.decimals.is_some() {
                return Err(programmer(format!(
                    "{}.{}: decimals only apply to float properties",
                    entity, property.name
                )));
            }
        }
        ColumnType::Reference(target) if target.is_empty() => {
            return Err(programmer(format!(
                "{}.{} references no entity type",
                entity, property.name
            )));
        }
        other => {
            if property.length.is_some() || property.decimals.is_some() {
                return Err(programmer(format!(
                    "{}.{}: length/decimals do not apply to {} properties",
                    entity,
                    property.name,
                    other.name()
                )));
            }
        }
    }

    if let Some(default) = property.default.take() {
        let normalized = value::coerce(property, default).map_err(|err| {
            programmer(format!(
                "default of {}.{} is invalid: {}",
                entity, property.name, err
            ))
        })?;
        property.default = if normalized.is_null() {
            None
        } else {
            Some(normalized)
        };
    }

    if property.lazy_fetch && property.is_reference() {
        return Err(programmer(format!(
            "{}.{}: reference properties cannot be lazy",
            entity, property.name
        )));
    }
    Ok(())
}

fn check_identifier(kind: &str, name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(programmer(format!("invalid {} name '{}'", kind, name)))
    }
}

fn programmer(message: String) -> StoreError {
    tracing::error!(%message, "schema registration failed");
    StoreError::Programmer(message)
}

/// Descriptor of the per-connection array side-table
pub(crate) fn array_table_schema(connection: &str) -> EntitySchema {
    let mut schema = EntitySchema::new(ARRAY_TABLE)
        .connection(connection)
        .without_timestamps()
        .property(PropertyDef::text("owner_type").length(191).required())
        .property(PropertyDef::integer("owner_id").required())
        .property(PropertyDef::text("name").length(191).required())
        .property(PropertyDef::integer("position").required())
        .property(PropertyDef::text("value"))
        .index(IndexDef::unique(&["owner_type", "owner_id", "name", "position"]));
    schema.system = true;
    schema.positions = schema
        .properties
        .iter()
        .enumerate()
        .map(|(i, p)| (p.name.clone(), i))
        .collect();
    schema
}

/// All registered entity types, shared read-only across sessions
pub struct SchemaRegistry {
    entities: BTreeMap<String, Arc<EntitySchema>>,
    hooks: HashMap<String, Arc<dyn EntityHooks>>,
    default_hooks: Arc<dyn EntityHooks>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            entities: BTreeMap::new(),
            hooks: HashMap::new(),
            default_hooks: Arc::new(DefaultHooks),
        }
    }

    /// Register an entity type
    pub fn register(&mut self, schema: EntitySchema) -> Result<Arc<EntitySchema>> {
        if schema.name == ARRAY_TABLE {
            return Err(programmer(format!("{} is a reserved table name", ARRAY_TABLE)));
        }
        if self.entities.contains_key(&schema.name) {
            return Err(programmer(format!(
                "entity type {} already registered",
                schema.name
            )));
        }

        let schema = Arc::new(schema.finalize()?);
        tracing::debug!(
            entity = %schema.name,
            connection = %schema.connection,
            properties = schema.properties.len(),
            "registered entity type"
        );
        self.entities.insert(schema.name.clone(), schema.clone());
        Ok(schema)
    }

    /// Register an entity type together with its behaviour hooks
    pub fn register_with_hooks(
        &mut self,
        schema: EntitySchema,
        hooks: Arc<dyn EntityHooks>,
    ) -> Result<Arc<EntitySchema>> {
        let schema = self.register(schema)?;
        self.hooks.insert(schema.name.clone(), hooks);
        Ok(schema)
    }

    /// Check cross-type declarations once every type is registered
    pub fn validate(&self) -> Result<()> {
        for schema in self.entities.values() {
            for property in schema.references() {
                if let Some(target) = property.reference_target() {
                    if !self.entities.contains_key(target) {
                        return Err(programmer(format!(
                            "{}.{} references unregistered type {}",
                            schema.name, property.name, target
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<EntitySchema>> {
        self.entities
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownEntity(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn hooks(&self, name: &str) -> Arc<dyn EntityHooks> {
        self.hooks
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_hooks.clone())
    }

    pub fn list_entities(&self) -> Vec<String> {
        self.entities.keys().cloned().collect()
    }

    /// Connection ids used by at least one entity type
    pub fn connection_ids(&self) -> BTreeSet<String> {
        self.entities
            .values()
            .map(|schema| schema.connection.clone())
            .collect()
    }

    /// Every table living on a connection, the array side-table included
    pub fn schemas_for_connection(&self, connection: &str) -> Vec<Arc<EntitySchema>> {
        let mut schemas: Vec<Arc<EntitySchema>> = self
            .entities
            .values()
            .filter(|schema| schema.connection == connection)
            .cloned()
            .collect();
        schemas.push(Arc::new(array_table_schema(connection)));
        schemas
    }

    /// Generate CREATE TABLE / CREATE INDEX SQL for every table on a connection
    pub fn generate_ddl(&self, connection: &str, dialect: Dialect) -> String {
        let mut statements = Vec::new();
        for schema in self.schemas_for_connection(connection) {
            statements.push(dialect.create_table_sql(&schema));
            for index in schema.indexes() {
                statements.push(dialect.create_index_sql(schema.table_name(), index));
            }
        }
        statements
            .iter()
            .map(|s| format!("{};", s))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SchemaRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaRegistry")
            .field("entities", &self.entities.keys().collect::<Vec<_>>())
            .field("hooks", &self.hooks.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn invoice() -> EntitySchema {
        EntitySchema::new("Invoice")
            .property(PropertyDef::float("net").length(14).decimals(2))
            .property(PropertyDef::date("date"))
            .property(PropertyDef::text("number").length(32).required())
            .index(IndexDef::unique(&["number"]))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = SchemaRegistry::new();
        registry.register(invoice()).unwrap();

        let schema = registry.get("Invoice").unwrap();
        assert_eq!(schema.table_name(), "Invoice");
        assert_eq!(schema.connection_id(), DEFAULT_CONNECTION);
        assert_eq!(schema.property_def("net").unwrap().decimals, Some(2));
        assert_eq!(
            schema.column_names(),
            vec!["id", "net", "date", "number", "created_at", "updated_at"]
        );
        assert!(matches!(
            registry.get("Order"),
            Err(StoreError::UnknownEntity(_))
        ));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut registry = SchemaRegistry::new();
        registry.register(invoice()).unwrap();
        assert!(matches!(
            registry.register(invoice()),
            Err(StoreError::Programmer(_))
        ));
    }

    #[test]
    fn test_override_applies() {
        let mut registry = SchemaRegistry::new();
        let schema = registry
            .register(
                invoice().override_property(PropertyOverride::new("net").length(16).decimals(4)),
            )
            .unwrap();

        let net = schema.property_def("net").unwrap();
        assert_eq!(net.length, Some(16));
        assert_eq!(net.decimals, Some(4));
    }

    #[test]
    fn test_override_of_undeclared_property_is_programmer_error() {
        let mut registry = SchemaRegistry::new();
        let err = registry
            .register(invoice().override_property(PropertyOverride::new("gross").length(10)))
            .unwrap_err();

        assert!(err.is_fatal());
        assert!(err.to_string().contains("gross"));
        assert!(!registry.contains("Invoice"));
    }

    #[test]
    fn test_index_on_undeclared_property() {
        let mut registry = SchemaRegistry::new();
        let result = registry.register(invoice().index(IndexDef::index(&["customer"])));
        assert!(matches!(result, Err(StoreError::Programmer(_))));
    }

    #[test]
    fn test_reserved_names() {
        let mut registry = SchemaRegistry::new();
        let result = registry.register(EntitySchema::new("Tag").property(PropertyDef::integer("id")));
        assert!(matches!(result, Err(StoreError::Programmer(_))));

        let result = registry.register(EntitySchema::new(ARRAY_TABLE));
        assert!(matches!(result, Err(StoreError::Programmer(_))));
    }

    #[test]
    fn test_length_rules() {
        let mut registry = SchemaRegistry::new();
        let result =
            registry.register(EntitySchema::new("Flag").property(PropertyDef::boolean("on").length(1)));
        assert!(matches!(result, Err(StoreError::Programmer(_))));

        let schema = registry
            .register(EntitySchema::new("Price").property(PropertyDef::float("amount").decimals(3)))
            .unwrap();
        let amount = schema.property_def("amount").unwrap();
        assert_eq!(amount.length, Some(DEFAULT_DECIMAL_PRECISION));
        assert_eq!(amount.decimals, Some(3));
    }

    #[test]
    fn test_default_is_normalized() {
        let mut registry = SchemaRegistry::new();
        let schema = registry
            .register(
                EntitySchema::new("Counter")
                    .property(PropertyDef::float("ratio").decimals(2).default_value(1))
                    .property(PropertyDef::boolean("active").default_value(true)),
            )
            .unwrap();

        assert_eq!(schema.property_def("ratio").unwrap().default, Some(json!(1.0)));
        assert_eq!(schema.property_def("active").unwrap().default, Some(json!(true)));

        let result = registry.register(
            EntitySchema::new("Broken").property(PropertyDef::integer("count").default_value("many")),
        );
        assert!(matches!(result, Err(StoreError::Programmer(_))));
    }

    #[test]
    fn test_extend_merges_base_descriptor() {
        let base = EntitySchema::new("SystemValue")
            .property(PropertyDef::text("label").length(100).required())
            .property(PropertyDef::integer("sort"))
            .index(IndexDef::index(&["sort"]));

        let mut registry = SchemaRegistry::new();
        let schema = registry
            .register(
                EntitySchema::new("Country")
                    .property(PropertyDef::text("iso").length(2))
                    .extend(&base),
            )
            .unwrap();

        let names: Vec<&str> = schema.properties().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["label", "sort", "iso"]);
        assert_eq!(schema.indexes()[0].name("Country"), "Country_idx_sort");
    }

    #[test]
    fn test_validate_references() {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::new("Invoice").property(PropertyDef::reference("customer", "Customer")),
            )
            .unwrap();
        assert!(matches!(registry.validate(), Err(StoreError::Programmer(_))));

        registry
            .register(EntitySchema::new("Customer").property(PropertyDef::text("name")))
            .unwrap();
        assert!(registry.validate().is_ok());
    }

    #[test]
    fn test_schemas_for_connection_include_side_table() {
        let mut registry = SchemaRegistry::new();
        registry.register(invoice()).unwrap();
        registry
            .register(EntitySchema::new("Log").connection("audit"))
            .unwrap();

        let names: Vec<String> = registry
            .schemas_for_connection(DEFAULT_CONNECTION)
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["Invoice".to_string(), ARRAY_TABLE.to_string()]);
        assert_eq!(
            registry.connection_ids().into_iter().collect::<Vec<_>>(),
            vec!["audit".to_string(), "default".to_string()]
        );
    }

    #[test]
    fn test_long_index_names_are_shortened() {
        let short = IndexDef::unique(&["email"]);
        assert_eq!(short.name("Customer"), "Customer_unique_email");

        let long = IndexDef::index(&["billing_address_line", "billing_postal_code", "billing_country"]);
        let name = long.name("CustomerAccountSnapshot");
        assert_eq!(name.len(), 63);
        assert!(name.starts_with("CustomerAccountSnapshot_idx_billing_address_line_"));
        assert_eq!(name, long.name("CustomerAccountSnapshot"));
        assert_ne!(
            name,
            IndexDef::index(&["billing_address_line", "billing_postal_code", "billing_region"])
                .name("CustomerAccountSnapshot")
        );
    }

    #[test]
    fn test_generate_ddl() {
        let mut registry = SchemaRegistry::new();
        registry.register(invoice()).unwrap();

        let ddl = registry.generate_ddl(DEFAULT_CONNECTION, Dialect::Sqlite);
        assert!(ddl.contains("CREATE TABLE \"Invoice\""));
        assert!(ddl.contains("\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"));
        assert!(ddl.contains("\"net\" DECIMAL(14,2)"));
        assert!(ddl.contains("\"number\" VARCHAR(32) NOT NULL"));
        assert!(ddl.contains("CREATE UNIQUE INDEX \"Invoice_unique_number\" ON \"Invoice\" (\"number\")"));
        assert!(ddl.contains("CREATE TABLE \"storable_array\""));
    }
}
