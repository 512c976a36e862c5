use crate::error::{Result, StoreError};
use crate::schema::{EntitySchema, PropertyDef};
use crate::session::Session;
use crate::value;
use async_trait::async_trait;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

/// Shared handle to a live entity; identity is `Rc::ptr_eq`.
pub type EntityRef = Rc<RefCell<Entity>>;

/// Per-type behaviour supplied by the entity author
#[async_trait(?Send)]
pub trait EntityHooks: Send + Sync {
    /// Checked before every delete
    fn is_deletable(&self, _entity: &Entity) -> bool {
        true
    }

    /// Checked before every insert or update
    fn validate(&self, _entity: &Entity) -> Result<()> {
        Ok(())
    }

    /// Runs after every store, including stores that wrote nothing
    async fn after_store(&self, _session: &mut Session, _entity: &EntityRef) -> Result<()> {
        Ok(())
    }
}

/// Hooks used for types registered without any
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

#[async_trait(?Send)]
impl EntityHooks for DefaultHooks {}

/// In-memory instance of an entity type
#[derive(Debug, Clone)]
pub struct Entity {
    schema: Arc<EntitySchema>,
    id: Option<i64>,
    values: HashMap<String, Value>,
    /// Column values as last read from or written to the database
    original: HashMap<String, Value>,
    /// Lazy properties whose column value is known
    loaded: HashSet<String>,
    /// Lazy properties assigned before being loaded
    assigned: HashSet<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

impl Entity {
    pub(crate) fn new(schema: Arc<EntitySchema>) -> Self {
        let values = schema
            .properties()
            .iter()
            .map(|p| (p.name.clone(), p.default.clone().unwrap_or(Value::Null)))
            .collect();
        let loaded = schema.lazy_properties().map(|p| p.name.clone()).collect();
        Self {
            schema,
            id: None,
            values,
            original: HashMap::new(),
            loaded,
            assigned: HashSet::new(),
            created_at: None,
            updated_at: None,
        }
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn type_name(&self) -> &str {
        self.schema.name()
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    pub fn created_at(&self) -> Option<&str> {
        self.created_at.as_deref()
    }

    pub fn updated_at(&self) -> Option<&str> {
        self.updated_at.as_deref()
    }

    fn definition(&self, name: &str) -> Result<&PropertyDef> {
        self.schema
            .property_def(name)
            .ok_or_else(|| StoreError::unknown_property(self.schema.name(), name))
    }

    /// Current value of a property.
    ///
    /// Lazy properties of stored entities must be fetched first, see [`Session::get`].
    pub fn get(&self, name: &str) -> Result<&Value> {
        let property = self.definition(name)?;
        if property.lazy_fetch && !self.is_loaded(name) && !self.assigned.contains(name) {
            return Err(StoreError::LazyNotLoaded {
                entity: self.schema.name().to_string(),
                property: name.to_string(),
            });
        }
        Ok(self.values.get(name).unwrap_or(&Value::Null))
    }

    pub fn get_i64(&self, name: &str) -> Result<Option<i64>> {
        Ok(self.get(name)?.as_i64())
    }

    pub fn get_f64(&self, name: &str) -> Result<Option<f64>> {
        Ok(self.get(name)?.as_f64())
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        Ok(self.get(name)?.as_bool())
    }

    pub fn get_str(&self, name: &str) -> Result<Option<&str>> {
        Ok(self.get(name)?.as_str())
    }

    /// Assign a property, coercing the value to the property's type
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let property = self.definition(name)?;
        let coerced = value::coerce(property, value.into()).map_err(|reason| {
            StoreError::InvalidValue {
                entity: self.schema.name().to_string(),
                property: name.to_string(),
                reason,
            }
        })?;
        let lazy = property.lazy_fetch;

        if lazy && !self.is_loaded(name) {
            self.assigned.insert(name.to_string());
        }
        self.values.insert(name.to_string(), coerced);
        Ok(())
    }

    /// Point a reference property at a stored entity, or clear it with `None`
    pub fn set_reference(&mut self, name: &str, target: Option<&Entity>) -> Result<()> {
        let property = self.definition(name)?;
        let expected = property.reference_target().ok_or_else(|| StoreError::InvalidValue {
            entity: self.schema.name().to_string(),
            property: name.to_string(),
            reason: "not a reference property".to_string(),
        })?;

        let id = match target {
            None => Value::Null,
            Some(target) => {
                if target.type_name() != expected {
                    return Err(StoreError::InvalidValue {
                        entity: self.schema.name().to_string(),
                        property: name.to_string(),
                        reason: format!("expected {}, got {}", expected, target.type_name()),
                    });
                }
                let id = target
                    .id()
                    .ok_or_else(|| StoreError::NotPersisted(target.type_name().to_string()))?;
                Value::from(id)
            }
        };
        self.values.insert(name.to_string(), id);
        Ok(())
    }

    /// Raw id stored in a reference property
    pub fn reference_id(&self, name: &str) -> Result<Option<i64>> {
        let property = self.definition(name)?;
        if !property.is_reference() {
            return Err(StoreError::InvalidValue {
                entity: self.schema.name().to_string(),
                property: name.to_string(),
                reason: "not a reference property".to_string(),
            });
        }
        Ok(self.values.get(name).and_then(Value::as_i64))
    }

    /// Whether a lazy property's column value has been fetched; eager ones always are
    pub fn is_loaded(&self, name: &str) -> bool {
        match self.schema.property_def(name) {
            Some(p) if p.lazy_fetch => self.loaded.contains(name),
            Some(_) => true,
            None => false,
        }
    }

    pub(crate) fn needs_lazy_load(&self, name: &str) -> bool {
        !self.is_new() && !self.is_loaded(name) && !self.assigned.contains(name)
    }

    /// Properties whose current value differs from the stored one.
    ///
    /// Lazy properties take part once loaded; assigned but never loaded ones
    /// always count as changed.
    pub fn changed_properties(&self) -> Vec<String> {
        self.schema
            .properties()
            .iter()
            .filter(|p| {
                if p.lazy_fetch && !self.loaded.contains(&p.name) {
                    return self.assigned.contains(&p.name);
                }
                let current = self.values.get(&p.name).unwrap_or(&Value::Null);
                let original = self.original.get(&p.name).unwrap_or(&Value::Null);
                current != original
            })
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.is_new() || !self.changed_properties().is_empty()
    }

    pub(crate) fn value_or_null(&self, name: &str) -> &Value {
        self.values.get(name).unwrap_or(&Value::Null)
    }

    /// Overwrite eager state with a freshly read row
    pub(crate) fn hydrate(
        &mut self,
        id: i64,
        columns: HashMap<String, Value>,
        created_at: Option<String>,
        updated_at: Option<String>,
    ) {
        self.id = Some(id);
        for (name, value) in columns {
            if self.schema.property_def(&name).is_some_and(|p| p.lazy_fetch) {
                self.loaded.insert(name.clone());
                self.assigned.remove(&name);
            }
            self.original.insert(name.clone(), value.clone());
            self.values.insert(name, value);
        }
        if self.schema.has_timestamps() {
            self.created_at = created_at;
            self.updated_at = updated_at;
        }
    }

    /// Mark a loaded instance as freshly fetched with unknown lazy columns
    pub(crate) fn reset_lazy(&mut self) {
        for property in self.schema.lazy_properties() {
            self.loaded.remove(&property.name);
            self.values.insert(property.name.clone(), Value::Null);
        }
    }

    /// Cache a lazily fetched column
    pub(crate) fn load_lazy(&mut self, name: &str, value: Value) {
        self.loaded.insert(name.to_string());
        self.original.insert(name.to_string(), value.clone());
        self.values.insert(name.to_string(), value);
    }

    /// Record a successful write of `written` columns
    pub(crate) fn mark_stored(&mut self, id: i64, written: &[String], now: Option<&str>) {
        let inserted = self.id.is_none();
        self.id = Some(id);
        for name in written {
            let current = self.value_or_null(name).clone();
            self.original.insert(name.clone(), current);
            if self.assigned.remove(name) {
                self.loaded.insert(name.clone());
            }
        }
        if let Some(now) = now.filter(|_| self.schema.has_timestamps()) {
            if inserted {
                self.created_at = Some(now.to_string());
            }
            self.updated_at = Some(now.to_string());
        }
    }

    /// Detach from the database after a delete; the instance becomes new again
    pub(crate) fn mark_deleted(&mut self) {
        self.id = None;
        self.original.clear();
        self.assigned.clear();
        self.loaded = self.schema.lazy_properties().map(|p| p.name.clone()).collect();
        self.created_at = None;
        self.updated_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaRegistry;
    use serde_json::json;

    fn schema() -> Arc<EntitySchema> {
        let mut registry = SchemaRegistry::new();
        registry
            .register(
                EntitySchema::new("Document")
                    .property(PropertyDef::text("title").length(20).required())
                    .property(PropertyDef::text("body").lazy())
                    .property(PropertyDef::integer("views").default_value(0))
                    .property(PropertyDef::reference("author", "Document")),
            )
            .unwrap()
    }

    fn stored() -> Entity {
        let mut entity = Entity::new(schema());
        let columns = HashMap::from([
            ("title".to_string(), json!("Hello")),
            ("views".to_string(), json!(3)),
            ("author".to_string(), Value::Null),
        ]);
        entity.hydrate(1, columns, None, None);
        entity.reset_lazy();
        entity
    }

    #[test]
    fn test_new_entity_defaults() {
        let entity = Entity::new(schema());
        assert!(entity.is_new());
        assert_eq!(entity.get("views").unwrap(), &json!(0));
        assert_eq!(entity.get("body").unwrap(), &Value::Null);
        assert!(entity.is_dirty());
    }

    #[test]
    fn test_set_coerces_and_rejects() {
        let mut entity = Entity::new(schema());
        entity.set("views", "7").unwrap();
        assert_eq!(entity.get_i64("views").unwrap(), Some(7));

        let err = entity.set("title", "x".repeat(21)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue { .. }));
        assert!(!err.is_fatal());

        let err = entity.set("subtitle", "x").unwrap_err();
        assert!(matches!(err, StoreError::UnknownProperty { .. }));
    }

    #[test]
    fn test_change_tracking() {
        let mut entity = stored();
        assert!(entity.changed_properties().is_empty());

        entity.set("views", 3).unwrap();
        assert!(entity.changed_properties().is_empty());

        entity.set("views", 4).unwrap();
        assert_eq!(entity.changed_properties(), vec!["views".to_string()]);
    }

    #[test]
    fn test_lazy_change_tracking() {
        let mut entity = stored();
        assert!(matches!(
            entity.get("body"),
            Err(StoreError::LazyNotLoaded { .. })
        ));
        assert!(entity.needs_lazy_load("body"));

        entity.load_lazy("body", json!("text"));
        assert!(entity.changed_properties().is_empty());
        entity.set("body", "text").unwrap();
        assert!(entity.changed_properties().is_empty());

        let mut unloaded = stored();
        unloaded.set("body", "overwritten").unwrap();
        assert!(!unloaded.needs_lazy_load("body"));
        assert_eq!(unloaded.changed_properties(), vec!["body".to_string()]);

        unloaded.mark_stored(1, &["body".to_string()], None);
        assert!(unloaded.changed_properties().is_empty());
        assert!(unloaded.is_loaded("body"));
    }

    #[test]
    fn test_references() {
        let mut entity = stored();
        let target = stored();
        entity.set_reference("author", Some(&target)).unwrap();
        assert_eq!(entity.reference_id("author").unwrap(), Some(1));

        entity.set_reference("author", None).unwrap();
        assert_eq!(entity.reference_id("author").unwrap(), None);

        let unsaved = Entity::new(schema());
        assert!(matches!(
            entity.set_reference("author", Some(&unsaved)),
            Err(StoreError::NotPersisted(_))
        ));
        assert!(entity.reference_id("views").is_err());
    }

    #[test]
    fn test_mark_deleted() {
        let mut entity = stored();
        entity.mark_deleted();
        assert!(entity.is_new());
        assert!(entity.get("body").is_ok());
    }
}
