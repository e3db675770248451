//! Entity Store (§4.3): the in-memory normalized store.
//!
//! Mirrors the single-threaded cooperative scheduling model of §5 — the
//! store is built on `Rc`/`RefCell` rather than `Arc`/`Mutex`, the same way
//! a reactive-graph owner tree is inherently single-threaded. A
//! [`crate::client::QueryClient`] that needs to cross an `async` task
//! boundary does so by cloning out of the store, never by sharing it across
//! threads.

use qcache_common::EntityId;
use reactive_graph::owner::StoredValue;
use reactive_graph::prelude::*;
use reactive_graph::signal::RwSignal;
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// A subscription handle returned by `activate_stream`; invoking it (or
/// dropping it) unsubscribes.
pub type Unsubscribe = Box<dyn FnOnce()>;

struct EntityRecordInner {
    /// Always a plain JSON object shaped by the entity's schema.
    value: Value,
    /// Bumped atomically with every value swap; every reactive reader of
    /// any proxy property becomes a dependency of this signal.
    change_notifier: RwSignal<u64>,
    /// Cleared on every merge-update.
    parse_cache: HashMap<String, Value>,
    /// Captured by `setOptimisticSnapshot`, consumed by `revertOptimistic`/`clearOptimistic`.
    optimistic_snapshot: Option<Value>,
    /// Set by `activateStream`; invoked when the last reactive consumer drops the record.
    stream_unsubscribe: Option<Rc<RefCell<Option<Unsubscribe>>>>,
    /// Incoming-reference count, mirrored from the persistence layer for
    /// in-memory bookkeeping (the authoritative count lives in the KV).
    ref_count: u32,
    /// This entity's own outgoing entity references, discovered through its
    /// schema's sub-entity paths. Mirrored to the persistence layer by
    /// whatever calls `save_entity`, so a later cascading delete of this
    /// entity recurses into these the same way it already does for a
    /// query's ref-ids.
    ref_ids: Vec<EntityId>,
}

/// A live entry in the Entity Store.
#[derive(Clone)]
pub struct EntityRecord {
    inner: Rc<RefCell<EntityRecordInner>>,
}

impl EntityRecord {
    fn new(value: Value) -> Self {
        Self {
            inner: Rc::new(RefCell::new(EntityRecordInner {
                value,
                change_notifier: RwSignal::new(0),
                parse_cache: HashMap::new(),
                optimistic_snapshot: None,
                stream_unsubscribe: None,
                ref_count: 0,
                ref_ids: Vec::new(),
            })),
        }
    }

    /// Reading this signal registers the caller as a reactive dependency of
    /// the record's change notifier.
    pub fn change_notifier(&self) -> RwSignal<u64> {
        self.inner.borrow().change_notifier
    }

    pub fn raw_value(&self) -> Value {
        self.inner.borrow().value.clone()
    }

    pub fn get_cached_field(&self, field: &str) -> Option<Value> {
        self.inner.borrow().parse_cache.get(field).cloned()
    }

    pub fn cache_field(&self, field: &str, parsed: Value) {
        self.inner.borrow_mut().parse_cache.insert(field.to_string(), parsed);
    }

    pub fn ref_count(&self) -> u32 {
        self.inner.borrow().ref_count
    }

    pub fn set_ref_count(&self, count: u32) {
        self.inner.borrow_mut().ref_count = count;
    }

    /// This entity's own outgoing entity refs, as last set by `merge`/`preload`.
    pub fn ref_ids(&self) -> Vec<EntityId> {
        self.inner.borrow().ref_ids.clone()
    }
}

/// The in-memory normalized store: `EntityId -> EntityRecord`.
#[derive(Clone, Copy)]
pub struct EntityStore {
    records: StoredValue<HashMap<EntityId, EntityRecord>>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self {
            records: StoredValue::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.with_value(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `getOrCreate(key, def) → record`: creates an empty record lazily on
    /// first observation.
    pub fn get_or_create(&self, key: EntityId) -> EntityRecord {
        self.records.update_value(|records| {
            records
                .entry(key)
                .or_insert_with(|| EntityRecord::new(Value::Object(serde_json::Map::new())))
                .clone()
        })
    }

    pub fn get(&self, key: EntityId) -> Option<EntityRecord> {
        self.records.with_value(|records| records.get(&key).cloned())
    }

    /// `merge(key, partial, ref_ids)`: shallow-merges `partial` into
    /// `record.value`, clears `parseCache`, and bumps `changeNotifier`.
    /// Nested structures are replaced by reference — deep merge is not
    /// performed. `ref_ids` replaces the record's own tracked outgoing
    /// entity refs when `Some` (a full re-parse, as the entity parser
    /// performs); `None` leaves them untouched (an optimistic patch merge,
    /// which never carries a complete re-derived ref set).
    pub fn merge(&self, key: EntityId, partial: Value, ref_ids: Option<Vec<EntityId>>) {
        let record = self.get_or_create(key);
        let mut inner = record.inner.borrow_mut();
        match (&mut inner.value, partial) {
            (Value::Object(existing), Value::Object(incoming)) => {
                for (k, v) in incoming {
                    existing.insert(k, v);
                }
            }
            (slot, incoming) => *slot = incoming,
        }
        inner.parse_cache.clear();
        if let Some(ref_ids) = ref_ids {
            inner.ref_ids = ref_ids;
        }
        drop(inner);
        record.change_notifier().update(|n| *n = n.wrapping_add(1));
    }

    /// `preload(key, value, ref_ids)`: sets `value` without bumping the
    /// notifier — used when hydrating from the persistent store before any
    /// reader exists.
    pub fn preload(&self, key: EntityId, value: Value, ref_ids: Vec<EntityId>) {
        let record = self.get_or_create(key);
        let mut inner = record.inner.borrow_mut();
        inner.value = value;
        inner.parse_cache.clear();
        inner.ref_ids = ref_ids;
    }

    /// Captures `record.value` before an optimistic mutation. A second call
    /// on an un-cleared key is a no-op — nested snapshots are disallowed.
    pub fn set_optimistic_snapshot(&self, key: EntityId) {
        let record = self.get_or_create(key);
        let mut inner = record.inner.borrow_mut();
        if inner.optimistic_snapshot.is_none() {
            inner.optimistic_snapshot = Some(inner.value.clone());
        }
    }

    /// Restores the snapshot captured by `set_optimistic_snapshot`, if any.
    pub fn revert_optimistic(&self, key: EntityId) {
        if let Some(record) = self.get(key) {
            let mut inner = record.inner.borrow_mut();
            if let Some(snapshot) = inner.optimistic_snapshot.take() {
                inner.value = snapshot;
                inner.parse_cache.clear();
                drop(inner);
                record.change_notifier().update(|n| *n = n.wrapping_add(1));
            }
        }
    }

    /// Discards a captured snapshot without reverting (a successful commit).
    pub fn clear_optimistic(&self, key: EntityId) {
        if let Some(record) = self.get(key) {
            record.inner.borrow_mut().optimistic_snapshot = None;
        }
    }

    /// `activateStream(key, subscribe)`: subscribes lazily on first call,
    /// storing the unsubscribe closure on the record. `subscribe` receives a
    /// merge callback and returns the cancellation closure.
    pub fn activate_stream<F>(&self, key: EntityId, subscribe: F)
    where
        F: FnOnce(Box<dyn Fn(Value)>) -> Unsubscribe,
    {
        let record = self.get_or_create(key);
        let already_active = record.inner.borrow().stream_unsubscribe.is_some();
        if already_active {
            return;
        }

        let store_handle = self.records;
        let merge_key = key;
        let on_update: Box<dyn Fn(Value)> = Box::new(move |update| {
            // Stream updates are applied outside an in-flight reactive read;
            // callers are expected to invoke this from a scheduler tick, not
            // from inside a proxy's read path.
            store_handle.with_value(|records| {
                if let Some(record) = records.get(&merge_key) {
                    let mut inner = record.inner.borrow_mut();
                    if let Value::Object(existing) = &mut inner.value {
                        if let Value::Object(incoming) = update.clone() {
                            for (k, v) in incoming {
                                existing.insert(k, v);
                            }
                        }
                    }
                    inner.parse_cache.clear();
                    drop(inner);
                    record.change_notifier().update(|n| *n = n.wrapping_add(1));
                }
            });
        });

        let unsubscribe = subscribe(on_update);
        record.inner.borrow_mut().stream_unsubscribe = Some(Rc::new(RefCell::new(Some(unsubscribe))));
    }

    /// Invoked when the last reactive consumer of `key` drops — runs the
    /// stream's cancellation closure, if one is active.
    pub fn deactivate_stream(&self, key: EntityId) {
        if let Some(record) = self.get(key) {
            let maybe_cell = record.inner.borrow_mut().stream_unsubscribe.take();
            if let Some(cell) = maybe_cell {
                if let Some(unsub) = cell.borrow_mut().take() {
                    unsub();
                }
            }
        }
    }

    /// Removes an entity outright (cascading delete target from the
    /// persistence layer's ref-count bookkeeping).
    pub fn remove(&self, key: EntityId) {
        self.deactivate_stream(key);
        self.records.update_value(|records| {
            records.remove(&key);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_create_is_idempotent() {
        let store = EntityStore::new();
        let key = EntityId(1);
        let a = store.get_or_create(key);
        let b = store.get_or_create(key);
        a.cache_field("x", Value::from(1));
        assert_eq!(b.get_cached_field("x"), Some(Value::from(1)));
    }

    #[test]
    fn merge_clears_parse_cache_and_bumps_notifier() {
        let store = EntityStore::new();
        let key = EntityId(1);
        store.preload(key, serde_json::json!({"name": "Alice"}), Vec::new());
        let record = store.get_or_create(key);
        record.cache_field("name", Value::from("Alice"));
        store.merge(key, serde_json::json!({"name": "Alicia"}), None);
        assert_eq!(record.get_cached_field("name"), None);
        assert_eq!(record.raw_value()["name"], "Alicia");
    }

    #[test]
    fn optimistic_snapshot_round_trips() {
        let store = EntityStore::new();
        let key = EntityId(1);
        store.preload(key, serde_json::json!({"name": "Alice"}), Vec::new());
        store.set_optimistic_snapshot(key);
        store.merge(key, serde_json::json!({"name": "Bob"}), None);
        store.revert_optimistic(key);
        let record = store.get(key).unwrap();
        assert_eq!(record.raw_value()["name"], "Alice");
    }

    #[test]
    fn second_snapshot_on_uncleared_key_is_a_no_op() {
        let store = EntityStore::new();
        let key = EntityId(1);
        store.preload(key, serde_json::json!({"name": "Alice"}), Vec::new());
        store.set_optimistic_snapshot(key);
        store.merge(key, serde_json::json!({"name": "Bob"}), None);
        store.set_optimistic_snapshot(key); // must not overwrite the first snapshot
        store.merge(key, serde_json::json!({"name": "Carol"}), None);
        store.revert_optimistic(key);
        let record = store.get(key).unwrap();
        assert_eq!(record.raw_value()["name"], "Alice");
    }
}
