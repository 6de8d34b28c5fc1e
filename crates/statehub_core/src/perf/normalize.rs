//! Entity normalisation: ordered lists to `{entities, ids}` and back.

use crate::error::StateError;
use crate::utils::{as_object, merge_shallow};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Entities keyed by id plus their order.
///
/// Every operation returns a new state and leaves `self` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedState<T> {
    pub entities: HashMap<String, T>,
    pub ids: Vec<String>,
    id_key: String,
}

impl<T: Serialize + Clone> NormalizedState<T> {
    /// Indexes `items` by the field `id_key`. A repeated id keeps its first
    /// position and its last value.
    pub fn normalize(items: &[T], id_key: &str) -> Result<Self, StateError> {
        let mut state = Self {
            entities: HashMap::with_capacity(items.len()),
            ids: Vec::with_capacity(items.len()),
            id_key: id_key.to_string(),
        };
        for item in items {
            state.insert(item.clone())?;
        }
        Ok(state)
    }

    pub fn id_key(&self) -> &str {
        &self.id_key
    }

    /// Entities in id order.
    pub fn denormalize(&self) -> Vec<T> {
        self.ids
            .iter()
            .filter_map(|id| self.entities.get(id).cloned())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.entities.get(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Appends `entity`, or replaces the entity with the same id in place.
    pub fn add_entity(&self, entity: T) -> Result<Self, StateError> {
        let mut next = self.clone();
        next.insert(entity)?;
        Ok(next)
    }

    pub fn remove_entity(&self, id: &str) -> Result<Self, StateError> {
        if !self.entities.contains_key(id) {
            return Err(StateError::EntityNotFound(id.to_string()));
        }
        let mut next = self.clone();
        next.entities.remove(id);
        next.ids.retain(|existing| existing != id);
        Ok(next)
    }

    fn insert(&mut self, entity: T) -> Result<(), StateError> {
        let id = entity_id(&serde_json::to_value(&entity)?, &self.id_key)?;
        if self.entities.insert(id.clone(), entity).is_none() {
            self.ids.push(id);
        }
        Ok(())
    }
}

impl<T: Serialize + DeserializeOwned + Clone> NormalizedState<T> {
    /// Shallow-merges `patch` into the entity with `id`. The id field itself
    /// cannot be changed.
    pub fn update_entity(&self, id: &str, patch: &Value) -> Result<Self, StateError> {
        let current = self
            .entities
            .get(id)
            .ok_or_else(|| StateError::EntityNotFound(id.to_string()))?;

        let mut merged = match serde_json::to_value(current)? {
            Value::Object(map) => map,
            other => return Err(StateError::InvalidPatch(format!("entity '{id}' is not an object: {other}"))),
        };
        let id_value = merged.get(&self.id_key).cloned();
        merge_shallow(&mut merged, as_object(patch)?);
        if let Some(id_value) = id_value {
            merged.insert(self.id_key.clone(), id_value);
        }

        let mut next = self.clone();
        next.entities
            .insert(id.to_string(), serde_json::from_value(Value::Object(merged))?);
        Ok(next)
    }
}

/// Reads `id_key` from a serialised entity. String and number ids are accepted.
fn entity_id(entity: &Value, id_key: &str) -> Result<String, StateError> {
    match entity.get(id_key) {
        Some(Value::String(id)) => Ok(id.clone()),
        Some(Value::Number(id)) => Ok(id.to_string()),
        _ => Err(StateError::MissingId(id_key.to_string())),
    }
}
