//! Parser / Proxy layer, proxy half (§4.2, §4.3).
//!
//! A generated entity façade substitutes for the source's per-field
//! accessor proxies (§9 "Property proxies"): `EntityProxy::get` looks the
//! field definition up in the entity's schema, parses lazily on first
//! access, caches on the record, and reads the record's change notifier so
//! that any reactive consumer of a field becomes a dependency of the whole
//! entity's notifier — field-level granularity is a cache-hit optimization,
//! not a dependency-tracking one, matching §4.2's contract.

use crate::entity_store::{EntityRecord, EntityStore};
use crate::error::ValidationError;
use crate::parser::{parse_value, FormatterRegistry, ParseContext};
use crate::registry::{EntityShape, TypeDef};
use qcache_common::EntityId;
use reactive_graph::prelude::*;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::rc::Rc;
use std::sync::Arc;

/// A lazy, reactive view over one entity record.
///
/// Cheap to clone — it's a key plus a handle into the store, not a copy of
/// the entity's data.
#[derive(Clone)]
pub struct EntityProxy {
    key: EntityId,
    record: EntityRecord,
    shape: Arc<EntityShape>,
    store: EntityStore,
    formatters: Rc<FormatterRegistry>,
}

impl EntityProxy {
    pub fn new(key: EntityId, record: EntityRecord, shape: Arc<EntityShape>, store: EntityStore, formatters: Rc<FormatterRegistry>) -> Self {
        Self { key, record, shape, store, formatters }
    }

    pub fn key(&self) -> EntityId {
        self.key
    }

    /// Reads and parses a single field, tracking the entity's change
    /// notifier as a reactive dependency.
    pub fn get_value(&self, field: &str) -> Result<Value, ValidationError> {
        // every access registers a dependency on record.changeNotifier
        self.record.change_notifier().get();

        if let Some(cached) = self.record.get_cached_field(field) {
            return Ok(cached);
        }

        let field_def = self
            .shape
            .fields
            .get(field)
            .ok_or_else(|| ValidationError::new(field, "declared field", "undeclared field"))?;

        let raw = self
            .record
            .raw_value()
            .get(field)
            .cloned()
            .unwrap_or(Value::Null);

        let ctx = ParseContext {
            entity_store: &self.store,
            formatters: &self.formatters,
        };
        let mut refs_out = Vec::new();
        let parsed = parse_value(&raw, field_def, field, &ctx, &mut refs_out)?;
        self.record.cache_field(field, parsed.clone());
        Ok(parsed)
    }

    pub fn get<T: DeserializeOwned>(&self, field: &str) -> Result<T, ValidationError> {
        let value = self.get_value(field)?;
        serde_json::from_value(value).map_err(|e| ValidationError::new(field, "deserializable field", e.to_string()))
    }

    /// Proxies serialize as `{entityRef: key}` — the same marker
    /// `parse_entity` embeds at the position a proxy would otherwise occupy,
    /// so a parsed tree and a subsequently-read proxy tree agree.
    pub fn to_json(&self) -> Value {
        serde_json::json!({ "entityRef": self.key.0 })
    }

    pub fn shape(&self) -> &EntityShape {
        &self.shape
    }
}

/// `createEntityProxy(entityKey, record, def)` (§4.2).
pub fn create_entity_proxy(
    key: EntityId,
    record: EntityRecord,
    def: &TypeDef,
    store: EntityStore,
    formatters: Rc<FormatterRegistry>,
) -> Option<EntityProxy> {
    def.as_entity()
        .map(|shape| EntityProxy::new(key, record, Arc::new(shape.clone()), store, formatters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::builders;

    #[test]
    fn proxy_parses_and_caches_fields() {
        let store = EntityStore::new();
        let formatters = Rc::new(FormatterRegistry::new());
        let def = builders::entity(
            "User",
            [("typename", builders::typename("User")), ("id", builders::id()), ("name", builders::string())],
            None,
        );
        let key = EntityId(1);
        store.preload(key, serde_json::json!({"typename": "User", "id": "1", "name": "Alice"}), Vec::new());
        let record = store.get_or_create(key);
        let proxy = create_entity_proxy(key, record.clone(), &def, store, formatters).unwrap();

        let name: String = proxy.get("name").unwrap();
        assert_eq!(name, "Alice");
        assert!(record.get_cached_field("name").is_some());
    }

    #[test]
    fn proxy_round_trips_as_entity_ref() {
        let store = EntityStore::new();
        let formatters = Rc::new(FormatterRegistry::new());
        let def = builders::entity("User", [("typename", builders::typename("User")), ("id", builders::id())], None);
        let key = EntityId(7);
        let record = store.get_or_create(key);
        let proxy = create_entity_proxy(key, record, &def, store, formatters).unwrap();
        assert_eq!(proxy.to_json(), serde_json::json!({"entityRef": 7}));
    }
}
