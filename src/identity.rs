use crate::entity::EntityRef;
use crate::error::{Result, StoreError};
use std::collections::HashMap;
use std::rc::Rc;

/// Cache of the single live instance per (entity type, id) on one connection
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<(String, i64), EntityRef>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pure lookup, no I/O
    pub fn get(&self, entity_type: &str, id: i64) -> Option<EntityRef> {
        self.entries.get(&(entity_type.to_string(), id)).cloned()
    }

    pub fn contains(&self, entity_type: &str, id: i64) -> bool {
        self.entries.contains_key(&(entity_type.to_string(), id))
    }

    /// Register an instance; registering a different instance for a taken key is a programmer error.
    pub fn register(&mut self, entity_type: &str, id: i64, entity: &EntityRef) -> Result<()> {
        let key = (entity_type.to_string(), id);
        if let Some(existing) = self.entries.get(&key) {
            if Rc::ptr_eq(existing, entity) {
                return Ok(());
            }
            let message = format!("duplicate instance of {} #{} in identity map", entity_type, id);
            tracing::error!(entity = entity_type, id, "{}", message);
            return Err(StoreError::Programmer(message));
        }

        tracing::debug!(entity = entity_type, id, "identity map register");
        self.entries.insert(key, entity.clone());
        Ok(())
    }

    pub fn evict(&mut self, entity_type: &str, id: i64) -> Option<EntityRef> {
        let evicted = self.entries.remove(&(entity_type.to_string(), id));
        if evicted.is_some() {
            tracing::debug!(entity = entity_type, id, "identity map evict");
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
