//! The synchronous configuration of the Query Store (§4.4): the delegate is
//! a blocking key/value map and every operation runs inline. Suitable for
//! in-process and test scenarios, and for backends that emulate
//! synchronicity.

use super::lru;
use crate::entity_store::EntityStore;
use qcache_common::{persisted_keys, EntityId, KvBuffer, KvDelegate, QueryId, StorageError};
use serde_json::Value;

/// Default `gcTime`: persisted query values older than this are treated as
/// absent on load (§4.4, §6 defaults).
pub const DEFAULT_GC_TIME_MS: f64 = 24.0 * 60.0 * 60.0 * 1000.0;

/// Default `maxCount` per query family (§4.4, §6 defaults).
pub const DEFAULT_MAX_COUNT: usize = 50;

pub struct SyncQueryStore<K: KvDelegate> {
    delegate: K,
}

impl<K: KvDelegate> SyncQueryStore<K> {
    pub fn new(delegate: K) -> Self {
        Self { delegate }
    }

    fn read_buffer(&self, key: &str) -> Result<Vec<u32>, StorageError> {
        Ok(self.delegate.get_buffer(key)?.unwrap_or_default())
    }

    fn read_ref_count(&self, id: u32) -> Result<u32, StorageError> {
        Ok(self
            .delegate
            .get_number(&persisted_keys::ref_count(id))?
            .map(|n| n as u32)
            .unwrap_or(0))
    }

    fn write_ref_count(&self, id: u32, count: u32) -> Result<(), StorageError> {
        self.delegate.set_number(&persisted_keys::ref_count(id), count as f64)
    }

    /// Increments `id`'s reference count by one.
    fn increment_ref(&self, id: u32) -> Result<(), StorageError> {
        let count = self.read_ref_count(id)?;
        self.write_ref_count(id, count + 1)
    }

    /// Decrements `id`'s reference count by one. At zero, deletes the
    /// value and recursively decrements whatever `id`'s own ref-ids buffer
    /// points to (if it carries one) before removing that buffer too.
    fn decrement_ref(&self, id: u32) -> Result<(), StorageError> {
        let count = self.read_ref_count(id)?;
        if count == 0 {
            return Ok(());
        }
        let new_count = count - 1;
        if new_count == 0 {
            let children = self.read_buffer(&persisted_keys::ref_ids(id))?;
            self.delegate.delete(&persisted_keys::value(id))?;
            self.delegate.delete(&persisted_keys::updated_at(id))?;
            self.delegate.delete(&persisted_keys::ref_ids(id))?;
            self.delegate.delete(&persisted_keys::ref_count(id))?;
            for child in children {
                self.decrement_ref(child)?;
            }
        } else {
            self.write_ref_count(id, new_count)?;
        }
        Ok(())
    }

    /// `saveQuery(def, key, value, updatedAt, refIds?)`: diffs `ref_ids`
    /// against the previously persisted set and adjusts reference counts
    /// accordingly (§4.4).
    pub fn save_query(
        &self,
        key: QueryId,
        value: &str,
        updated_at: f64,
        ref_ids: Option<&[EntityId]>,
    ) -> Result<(), StorageError> {
        let previous: Vec<u32> = self.read_buffer(&persisted_keys::ref_ids(key.0))?;
        let next: Vec<u32> = ref_ids.map(|ids| ids.iter().map(|e| e.0).collect()).unwrap_or_default();

        self.delegate.set_string(&persisted_keys::value(key.0), value)?;
        self.delegate.set_number(&persisted_keys::updated_at(key.0), updated_at)?;
        self.delegate.set_buffer(&persisted_keys::ref_ids(key.0), &next)?;

        for added in next.iter().filter(|id| !previous.contains(id)) {
            self.increment_ref(*added)?;
        }
        for removed in previous.iter().filter(|id| !next.contains(id)) {
            self.decrement_ref(*removed)?;
        }
        Ok(())
    }

    /// Persists a bare entity value (used for direct preloads and
    /// stream-driven merges that should survive a restart), diffing
    /// `ref_ids` against the entity's previously persisted set the same way
    /// `save_query` does — so a cascading delete that reaches this entity
    /// recurses into its own children too (§8 scenario 2).
    pub fn save_entity(&self, key: EntityId, value: &str, ref_ids: Option<&[EntityId]>) -> Result<(), StorageError> {
        let previous: Vec<u32> = self.read_buffer(&persisted_keys::ref_ids(key.0))?;
        let next: Vec<u32> = ref_ids.map(|ids| ids.iter().map(|e| e.0).collect()).unwrap_or_default();

        self.delegate.set_string(&persisted_keys::value(key.0), value)?;
        self.delegate.set_buffer(&persisted_keys::ref_ids(key.0), &next)?;

        for added in next.iter().filter(|id| !previous.contains(id)) {
            self.increment_ref(*added)?;
        }
        for removed in previous.iter().filter(|id| !next.contains(id)) {
            self.decrement_ref(*removed)?;
        }
        Ok(())
    }

    /// `activateQuery(def, key)`: moves `key` to the head of its family's
    /// LRU queue; cascade-deletes the tail if the family now exceeds
    /// `max_count`.
    pub fn activate_query(&self, query_def_id: u64, key: QueryId, max_count: usize) -> Result<(), StorageError> {
        let queue_key = persisted_keys::queue(query_def_id);
        let mut queue: KvBuffer = self.read_buffer(&queue_key)?;
        let evicted = lru::touch(&mut queue, key.0, max_count);
        self.delegate.set_buffer(&queue_key, &queue)?;
        if let Some(evicted_id) = evicted {
            self.evict_query_value_only(QueryId(evicted_id))?;
        }
        Ok(())
    }

    /// Removes a query's persisted value/ref-ids and cascade-decrements its
    /// refs, without touching any family queue (used by `evict_query` for
    /// the explicit-clear path, and internally by LRU-driven eviction which
    /// has already updated the queue itself).
    fn evict_query_value_only(&self, key: QueryId) -> Result<(), StorageError> {
        let refs = self.read_buffer(&persisted_keys::ref_ids(key.0))?;
        self.delegate.delete(&persisted_keys::value(key.0))?;
        self.delegate.delete(&persisted_keys::updated_at(key.0))?;
        self.delegate.delete(&persisted_keys::ref_ids(key.0))?;
        self.delegate.delete(&persisted_keys::stream_orphan_refs(key.0))?;
        self.delegate.delete(&persisted_keys::optimistic_insert_refs(key.0))?;
        for id in refs {
            self.decrement_ref(id)?;
        }
        Ok(())
    }

    /// Explicit eviction (not an LRU capacity trim): removes `key` from its
    /// family's queue too.
    pub fn evict_query(&self, query_def_id: u64, key: QueryId) -> Result<(), StorageError> {
        let queue_key = persisted_keys::queue(query_def_id);
        let mut queue = self.read_buffer(&queue_key)?;
        lru::remove(&mut queue, key.0);
        self.delegate.set_buffer(&queue_key, &queue)?;
        self.evict_query_value_only(key)
    }

    pub fn clear_optimistic_insert_refs(&self, key: QueryId) -> Result<(), StorageError> {
        self.delegate.delete(&persisted_keys::optimistic_insert_refs(key.0))
    }

    pub fn set_stream_orphan_refs(&self, key: QueryId, orphan_refs: &[EntityId]) -> Result<(), StorageError> {
        let buf: KvBuffer = orphan_refs.iter().map(|e| e.0).collect();
        self.delegate.set_buffer(&persisted_keys::stream_orphan_refs(key.0), &buf)
    }

    /// `loadQuery(def, key, entityMap) → {value, updatedAt, refIds} |
    /// undefined`. Absent when missing or stale past `gc_time_ms`. On
    /// success, preloads every referenced entity so proxy reads don't
    /// block.
    pub fn load_query(
        &self,
        key: QueryId,
        entity_store: &EntityStore,
        now_ms: f64,
        gc_time_ms: f64,
    ) -> Result<Option<(String, f64, Vec<EntityId>)>, StorageError> {
        let Some(updated_at) = self.delegate.get_number(&persisted_keys::updated_at(key.0))? else {
            return Ok(None);
        };
        if now_ms - updated_at > gc_time_ms {
            return Ok(None);
        }
        let Some(value) = self.delegate.get_string(&persisted_keys::value(key.0))? else {
            return Ok(None);
        };
        let ref_ids: Vec<EntityId> = self
            .read_buffer(&persisted_keys::ref_ids(key.0))?
            .into_iter()
            .map(EntityId)
            .collect();

        for entity_key in &ref_ids {
            if let Some(raw) = self.delegate.get_string(&persisted_keys::value(entity_key.0))? {
                if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
                    let child_refs: Vec<EntityId> = self.read_buffer(&persisted_keys::ref_ids(entity_key.0))?.into_iter().map(EntityId).collect();
                    entity_store.preload(*entity_key, parsed, child_refs);
                }
            }
        }

        Ok(Some((value, updated_at, ref_ids)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemDelegate {
        strings: RefCell<HashMap<String, String>>,
        numbers: RefCell<HashMap<String, f64>>,
        buffers: RefCell<HashMap<String, KvBuffer>>,
    }

    impl KvDelegate for MemDelegate {
        fn has(&self, key: &str) -> bool {
            self.strings.borrow().contains_key(key)
                || self.numbers.borrow().contains_key(key)
                || self.buffers.borrow().contains_key(key)
        }
        fn get_string(&self, key: &str) -> Result<Option<String>, StorageError> {
            Ok(self.strings.borrow().get(key).cloned())
        }
        fn get_number(&self, key: &str) -> Result<Option<f64>, StorageError> {
            Ok(self.numbers.borrow().get(key).copied())
        }
        fn get_buffer(&self, key: &str) -> Result<Option<KvBuffer>, StorageError> {
            Ok(self.buffers.borrow().get(key).cloned())
        }
        fn set_string(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.strings.borrow_mut().insert(key.to_string(), value.to_string());
            Ok(())
        }
        fn set_number(&self, key: &str, value: f64) -> Result<(), StorageError> {
            self.numbers.borrow_mut().insert(key.to_string(), value);
            Ok(())
        }
        fn set_buffer(&self, key: &str, value: &KvBuffer) -> Result<(), StorageError> {
            self.buffers.borrow_mut().insert(key.to_string(), value.clone());
            Ok(())
        }
        fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.strings.borrow_mut().remove(key);
            self.numbers.borrow_mut().remove(key);
            self.buffers.borrow_mut().remove(key);
            Ok(())
        }
    }

    #[test]
    fn ref_count_tracks_number_of_holders() {
        let store = SyncQueryStore::new(MemDelegate::default());
        store.save_query(QueryId(1), "a", 0.0, Some(&[EntityId(9)])).unwrap();
        store.save_query(QueryId(2), "b", 0.0, Some(&[EntityId(9)])).unwrap();
        assert_eq!(store.read_ref_count(9).unwrap(), 2);

        store.save_query(QueryId(1), "a2", 0.0, Some(&[])).unwrap();
        assert_eq!(store.read_ref_count(9).unwrap(), 1);
        assert!(store.delegate.has(&persisted_keys::value(9)));

        store.save_query(QueryId(2), "b2", 0.0, Some(&[])).unwrap();
        assert_eq!(store.read_ref_count(9).unwrap(), 0);
        assert!(!store.delegate.has(&persisted_keys::value(9)));
    }

    #[test]
    fn cascading_deletion_recurses_into_children() {
        let store = SyncQueryStore::new(MemDelegate::default());
        // post (id=1) references tag (id=2), which itself is a leaf.
        store.increment_ref(2).unwrap();
        store.delegate.set_buffer(&persisted_keys::ref_ids(1), &vec![2]).unwrap();
        store.delegate.set_string(&persisted_keys::value(1), "post").unwrap();
        store.write_ref_count(1, 1).unwrap();

        store.decrement_ref(1).unwrap();
        assert!(!store.delegate.has(&persisted_keys::value(1)));
        assert_eq!(store.read_ref_count(2).unwrap(), 0);
        assert!(!store.delegate.has(&persisted_keys::value(2)));
    }

    #[test]
    fn activate_query_evicts_past_capacity() {
        let store = SyncQueryStore::new(MemDelegate::default());
        for id in 1..=51u32 {
            store.save_query(QueryId(id), "v", 0.0, Some(&[])).unwrap();
            store.activate_query(7, QueryId(id), 50).unwrap();
        }
        assert!(!store.delegate.has(&persisted_keys::value(1)));
        assert!(store.delegate.has(&persisted_keys::value(51)));
        let queue = store.read_buffer(&persisted_keys::queue(7)).unwrap();
        assert!(queue.len() <= 50);
    }

    #[test]
    fn load_query_respects_gc_horizon() {
        let store = SyncQueryStore::new(MemDelegate::default());
        let entity_store = EntityStore::new();
        store.save_query(QueryId(1), "v", 1000.0, Some(&[])).unwrap();
        let fresh = store.load_query(QueryId(1), &entity_store, 1000.0 + 10.0, DEFAULT_GC_TIME_MS).unwrap();
        assert!(fresh.is_some());
        let stale = store
            .load_query(QueryId(1), &entity_store, 1000.0 + DEFAULT_GC_TIME_MS + 1.0, DEFAULT_GC_TIME_MS)
            .unwrap();
        assert!(stale.is_none());
    }
}
