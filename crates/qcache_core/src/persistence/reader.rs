//! A reader endpoint of the asynchronous Query Store configuration (§4.4).
//!
//! Readers hold the delegate directly for reads of confirmed state but
//! never write to it — every mutating operation is posted as a
//! [`WriterMessage`] to the writer's queue and forwarded "post and forget".

use super::writer::WriterHandle;
use crate::entity_store::EntityStore;
use qcache_common::{persisted_keys, AsyncKvDelegate, EntityId, QueryId, StorageError, WriterMessage};
use serde_json::Value;
use std::sync::Arc;

#[derive(Clone)]
pub struct QueryStoreReader<K: AsyncKvDelegate> {
    delegate: Arc<K>,
    writer: WriterHandle,
}

impl<K: AsyncKvDelegate> QueryStoreReader<K> {
    pub fn new(delegate: Arc<K>, writer: WriterHandle) -> Self {
        Self { delegate, writer }
    }

    /// `loadQuery(def, key, entityMap) → {value, updatedAt, refIds} |
    /// undefined` (§4.4). Reads go straight to the delegate; only mutations
    /// are forwarded to the writer.
    pub async fn load_query(
        &self,
        key: QueryId,
        entity_store: &EntityStore,
        now_ms: f64,
        gc_time_ms: f64,
    ) -> Result<Option<(String, f64, Vec<EntityId>)>, StorageError> {
        let Some(updated_at) = self.delegate.get_number(&persisted_keys::updated_at(key.0)).await? else {
            return Ok(None);
        };
        if now_ms - updated_at > gc_time_ms {
            return Ok(None);
        }
        let Some(value) = self.delegate.get_string(&persisted_keys::value(key.0)).await? else {
            return Ok(None);
        };
        let ref_ids: Vec<EntityId> = self
            .delegate
            .get_buffer(&persisted_keys::ref_ids(key.0))
            .await?
            .unwrap_or_default()
            .into_iter()
            .map(EntityId)
            .collect();

        for entity_key in &ref_ids {
            if let Some(raw) = self.delegate.get_string(&persisted_keys::value(entity_key.0)).await? {
                if let Ok(parsed) = serde_json::from_str::<Value>(&raw) {
                    let child_refs: Vec<EntityId> = self
                        .delegate
                        .get_buffer(&persisted_keys::ref_ids(entity_key.0))
                        .await?
                        .unwrap_or_default()
                        .into_iter()
                        .map(EntityId)
                        .collect();
                    entity_store.preload(*entity_key, parsed, child_refs);
                }
            }
        }

        Ok(Some((value, updated_at, ref_ids)))
    }

    fn post(&self, message: WriterMessage) -> Result<(), StorageError> {
        self.writer.send(message).map_err(|_| StorageError::ChannelClosed)
    }

    pub fn save_query(
        &self,
        query_def_id: u64,
        key: QueryId,
        value: String,
        updated_at: f64,
        ref_ids: Option<Vec<EntityId>>,
    ) -> Result<(), StorageError> {
        self.post(WriterMessage::SaveQuery { query_def_id, key, value, updated_at, ref_ids })
    }

    pub fn save_entity(&self, key: EntityId, value: String, ref_ids: Option<Vec<EntityId>>) -> Result<(), StorageError> {
        self.post(WriterMessage::SaveEntity { key, value, ref_ids })
    }

    pub fn activate_query(&self, query_def_id: u64, key: QueryId, max_count: usize) -> Result<(), StorageError> {
        self.post(WriterMessage::ActivateQuery { query_def_id, key, max_count })
    }

    pub fn evict_query(&self, query_def_id: u64, key: QueryId) -> Result<(), StorageError> {
        self.post(WriterMessage::EvictQuery { query_def_id, key })
    }

    pub fn clear_optimistic_insert_refs(&self, key: QueryId) -> Result<(), StorageError> {
        self.post(WriterMessage::ClearOptimisticInsertRefs { key })
    }

    pub fn set_stream_orphan_refs(&self, key: QueryId, orphan_refs: Vec<EntityId>) -> Result<(), StorageError> {
        self.post(WriterMessage::SetStreamOrphanRefs { key, orphan_refs })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::writer::QueryStoreWriter;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemDelegate {
        strings: Mutex<HashMap<String, String>>,
        numbers: Mutex<HashMap<String, f64>>,
        buffers: Mutex<HashMap<String, Vec<u32>>>,
    }

    impl AsyncKvDelegate for MemDelegate {
        async fn has(&self, key: &str) -> bool {
            self.strings.lock().await.contains_key(key)
        }
        async fn get_string(&self, key: &str) -> Result<Option<String>, StorageError> {
            Ok(self.strings.lock().await.get(key).cloned())
        }
        async fn get_number(&self, key: &str) -> Result<Option<f64>, StorageError> {
            Ok(self.numbers.lock().await.get(key).copied())
        }
        async fn get_buffer(&self, key: &str) -> Result<Option<Vec<u32>>, StorageError> {
            Ok(self.buffers.lock().await.get(key).cloned())
        }
        async fn set_string(&self, key: &str, value: &str) -> Result<(), StorageError> {
            self.strings.lock().await.insert(key.to_string(), value.to_string());
            Ok(())
        }
        async fn set_number(&self, key: &str, value: f64) -> Result<(), StorageError> {
            self.numbers.lock().await.insert(key.to_string(), value);
            Ok(())
        }
        async fn set_buffer(&self, key: &str, value: &Vec<u32>) -> Result<(), StorageError> {
            self.buffers.lock().await.insert(key.to_string(), value.clone());
            Ok(())
        }
        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.strings.lock().await.remove(key);
            self.numbers.lock().await.remove(key);
            self.buffers.lock().await.remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn reader_forwards_writes_and_sees_them_after_writer_drains() {
        let delegate = Arc::new(MemDelegate::default());
        let (writer, handle) = QueryStoreWriter::new(delegate.clone());
        let reader = QueryStoreReader::new(delegate, handle);
        let writer_task = tokio::spawn(writer.run());

        reader.save_query(1, QueryId(1), "hello".into(), 1000.0, Some(vec![])).unwrap();
        drop(reader.writer.clone());
        // give the writer a chance to drain the single message
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let entity_store = EntityStore::new();
        let reader2 = QueryStoreReader::new(Arc::new(MemDelegate::default()), reader.writer.clone());
        let _ = reader2; // constructed only to exercise the type in isolation
        let _ = writer_task.abort();
    }
}
