use crate::builder::{DeleteBuilder, InsertBuilder, SelectBuilder, Statement};
use crate::entity::EntityRef;
use crate::error::{Result, StoreError};
use crate::schema::ARRAY_TABLE;
use crate::session::Session;
use serde_json::Value;
use std::collections::HashMap;

type ArrayKey = (String, i64, String);

/// Per-session cache of side-table arrays; `None` caches "nothing stored"
#[derive(Debug, Default)]
pub struct ArrayStore {
    cache: HashMap<ArrayKey, Option<Vec<Value>>>,
}

impl ArrayStore {
    fn key(owner_type: &str, owner_id: i64, name: &str) -> ArrayKey {
        (owner_type.to_string(), owner_id, name.to_string())
    }

    fn cached(&self, owner_type: &str, owner_id: i64, name: &str) -> Option<&Option<Vec<Value>>> {
        self.cache.get(&Self::key(owner_type, owner_id, name))
    }

    fn put(&mut self, owner_type: &str, owner_id: i64, name: &str, values: Option<Vec<Value>>) {
        self.cache.insert(Self::key(owner_type, owner_id, name), values);
    }

    pub(crate) fn forget_owner(&mut self, owner_type: &str, owner_id: i64) {
        self.cache
            .retain(|(t, id, _), _| !(t == owner_type && *id == owner_id));
    }

    pub(crate) fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Owner identity of a stored entity
fn owner(entity: &EntityRef) -> Result<(String, i64, String)> {
    let e = entity.borrow();
    let id = e.id().ok_or_else(|| {
        StoreError::NotPersisted(format!("{} must be stored before using arrays", e.type_name()))
    })?;
    Ok((e.type_name().to_string(), id, e.schema().connection_id().to_string()))
}

fn delete_statement(owner_type: &str, owner_id: i64, name: Option<&str>) -> Result<Statement> {
    let mut delete = DeleteBuilder::new(ARRAY_TABLE)
        .where_eq("owner_type", owner_type)
        .where_eq("owner_id", owner_id);
    if let Some(name) = name {
        delete = delete.where_eq("name", name);
    }
    delete.build()
}

fn encode(value: &Value) -> Value {
    match value {
        Value::Null => Value::Null,
        other => Value::String(other.to_string()),
    }
}

fn decode(raw: Value) -> Value {
    match raw {
        Value::String(s) => serde_json::from_str(&s).unwrap_or(Value::String(s)),
        other => other,
    }
}

impl Session {
    /// Replace a named array of `owner`; an empty list clears it
    pub async fn set_array(&mut self, entity: &EntityRef, name: &str, values: Vec<Value>) -> Result<()> {
        let (owner_type, owner_id, connection) = owner(entity)?;

        let mut statements = vec![delete_statement(&owner_type, owner_id, Some(name))?];
        if !values.is_empty() {
            let mut insert = InsertBuilder::new(ARRAY_TABLE)
                .column("owner_type", "?")
                .column("owner_id", "?")
                .column("name", "?")
                .column("position", "?")
                .column("value", "?");
            for (position, value) in values.iter().enumerate() {
                insert = insert.row(vec![
                    Value::from(owner_type.as_str()),
                    Value::from(owner_id),
                    Value::from(name),
                    Value::from(position as i64),
                    encode(value),
                ]);
            }
            statements.push(insert.build()?);
        }

        self.run_unit(&connection, &statements).await?;

        let cached = if values.is_empty() { None } else { Some(values) };
        self.arrays.put(&owner_type, owner_id, name, cached);
        Ok(())
    }

    /// Stored array of `owner`, cached for the session; `None` when empty
    pub async fn get_array(
        &mut self,
        entity: &EntityRef,
        name: &str,
        force_reload: bool,
    ) -> Result<Option<Vec<Value>>> {
        let (owner_type, owner_id, connection) = owner(entity)?;
        if !force_reload {
            if let Some(cached) = self.arrays.cached(&owner_type, owner_id, name) {
                return Ok(cached.clone());
            }
        }

        let statement = SelectBuilder::new(ARRAY_TABLE)
            .select(vec!["\"value\""])
            .where_eq("owner_type", owner_type.as_str())
            .where_eq("owner_id", owner_id)
            .where_eq("name", name)
            .order_asc("position")
            .build()?;
        let rows = self.connection(&connection)?.fetch(&statement).await?;

        let values: Vec<Value> = rows
            .into_iter()
            .map(|mut row| decode(row.take("value")))
            .collect();
        let values = if values.is_empty() { None } else { Some(values) };
        self.arrays.put(&owner_type, owner_id, name, values.clone());
        Ok(values)
    }

    pub async fn delete_array(&mut self, entity: &EntityRef, name: &str) -> Result<()> {
        let (owner_type, owner_id, connection) = owner(entity)?;
        let statement = delete_statement(&owner_type, owner_id, Some(name))?;
        self.run_unit(&connection, &[statement]).await?;
        self.arrays.put(&owner_type, owner_id, name, None);
        Ok(())
    }

    /// Remove every array of `owner`
    pub async fn delete_arrays(&mut self, entity: &EntityRef) -> Result<()> {
        let (owner_type, owner_id, connection) = owner(entity)?;
        let statement = delete_statement(&owner_type, owner_id, None)?;
        self.run_unit(&connection, &[statement]).await?;
        self.arrays.forget_owner(&owner_type, owner_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_forget_owner() {
        let mut store = ArrayStore::default();
        store.put("Post", 1, "tags", Some(vec![json!("a")]));
        store.put("Post", 1, "links", None);
        store.put("Post", 2, "tags", Some(vec![json!("b")]));

        store.forget_owner("Post", 1);
        assert_eq!(store.len(), 1);
        assert!(store.cached("Post", 1, "tags").is_none());
        assert_eq!(store.cached("Post", 2, "tags"), Some(&Some(vec![json!("b")])));
    }

    #[test]
    fn test_encode_decode() {
        assert_eq!(encode(&json!("x")), json!("\"x\""));
        assert_eq!(decode(encode(&json!({"k": [1, 2]}))), json!({"k": [1, 2]}));
        assert_eq!(decode(json!("not json")), json!("not json"));
        assert_eq!(encode(&Value::Null), Value::Null);
    }
}
