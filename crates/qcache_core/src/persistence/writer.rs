//! The writer endpoint of the asynchronous Query Store configuration
//! (§4.4). Owns the delegate exclusively; processes a single FIFO queue of
//! [`WriterMessage`]s, each one fully completing — including all cascading
//! ref-count work — before the next begins. A failure on any single message
//! is caught, logged, and does not block the queue.

use super::lru;
use qcache_common::{persisted_keys, AsyncKvDelegate, KvBuffer, QueryId, StorageError, WriterMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sending half handed to readers; posting never blocks on the writer's
/// own processing.
pub type WriterHandle = mpsc::UnboundedSender<WriterMessage>;

pub struct QueryStoreWriter<K: AsyncKvDelegate> {
    delegate: Arc<K>,
    inbox: mpsc::UnboundedReceiver<WriterMessage>,
}

impl<K: AsyncKvDelegate> QueryStoreWriter<K> {
    pub fn new(delegate: Arc<K>) -> (Self, WriterHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { delegate, inbox: rx }, tx)
    }

    /// Runs the writer's loop until its channel is closed (every
    /// `WriterHandle` dropped). After each wake-up, drains every message
    /// already queued (without waiting for more) and conflates the batch
    /// before applying it in order — a second `SaveQuery` for a key that
    /// arrives before the first has drained replaces it in place rather than
    /// both racing through the delegate one after another.
    pub async fn run(mut self) {
        while let Some(first) = self.inbox.recv().await {
            let mut batch = vec![first];
            while let Ok(message) = self.inbox.try_recv() {
                batch.push(message);
            }
            for message in conflate(batch) {
                if let Err(err) = self.apply(message).await {
                    tracing::warn!(error = %err, "query store writer message failed, continuing with the next one");
                }
            }
        }
    }

    async fn read_buffer(&self, key: &str) -> Result<Vec<u32>, StorageError> {
        Ok(self.delegate.get_buffer(key).await?.unwrap_or_default())
    }

    async fn read_ref_count(&self, id: u32) -> Result<u32, StorageError> {
        Ok(self
            .delegate
            .get_number(&persisted_keys::ref_count(id))
            .await?
            .map(|n| n as u32)
            .unwrap_or(0))
    }

    async fn write_ref_count(&self, id: u32, count: u32) -> Result<(), StorageError> {
        self.delegate.set_number(&persisted_keys::ref_count(id), count as f64).await
    }

    async fn increment_ref(&self, id: u32) -> Result<(), StorageError> {
        let count = self.read_ref_count(id).await?;
        self.write_ref_count(id, count + 1).await
    }

    fn decrement_ref<'a>(&'a self, id: u32) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StorageError>> + 'a>> {
        Box::pin(async move {
            let count = self.read_ref_count(id).await?;
            if count == 0 {
                return Ok(());
            }
            let new_count = count - 1;
            if new_count == 0 {
                let children = self.read_buffer(&persisted_keys::ref_ids(id)).await?;
                self.delegate.delete(&persisted_keys::value(id)).await?;
                self.delegate.delete(&persisted_keys::updated_at(id)).await?;
                self.delegate.delete(&persisted_keys::ref_ids(id)).await?;
                self.delegate.delete(&persisted_keys::ref_count(id)).await?;
                for child in children {
                    self.decrement_ref(child).await?;
                }
            } else {
                self.write_ref_count(id, new_count).await?;
            }
            Ok(())
        })
    }

    async fn evict_query_value_only(&self, id: u32) -> Result<(), StorageError> {
        let refs = self.read_buffer(&persisted_keys::ref_ids(id)).await?;
        self.delegate.delete(&persisted_keys::value(id)).await?;
        self.delegate.delete(&persisted_keys::updated_at(id)).await?;
        self.delegate.delete(&persisted_keys::ref_ids(id)).await?;
        self.delegate.delete(&persisted_keys::stream_orphan_refs(id)).await?;
        self.delegate.delete(&persisted_keys::optimistic_insert_refs(id)).await?;
        for id in refs {
            self.decrement_ref(id).await?;
        }
        Ok(())
    }

    async fn apply(&self, message: WriterMessage) -> Result<(), StorageError> {
        match message {
            WriterMessage::SaveQuery { query_def_id: _, key, value, updated_at, ref_ids } => {
                let previous: Vec<u32> = self.read_buffer(&persisted_keys::ref_ids(key.0)).await?;
                let next: Vec<u32> = ref_ids.map(|ids| ids.into_iter().map(|e| e.0).collect()).unwrap_or_default();

                self.delegate.set_string(&persisted_keys::value(key.0), &value).await?;
                self.delegate.set_number(&persisted_keys::updated_at(key.0), updated_at).await?;
                self.delegate.set_buffer(&persisted_keys::ref_ids(key.0), &next).await?;

                for added in next.iter().filter(|id| !previous.contains(id)) {
                    self.increment_ref(*added).await?;
                }
                for removed in previous.iter().filter(|id| !next.contains(id)) {
                    self.decrement_ref(*removed).await?;
                }
                Ok(())
            }
            WriterMessage::SaveEntity { key, value, ref_ids } => {
                let previous: Vec<u32> = self.read_buffer(&persisted_keys::ref_ids(key.0)).await?;
                let next: Vec<u32> = ref_ids.map(|ids| ids.into_iter().map(|e| e.0).collect()).unwrap_or_default();

                self.delegate.set_string(&persisted_keys::value(key.0), &value).await?;
                self.delegate.set_buffer(&persisted_keys::ref_ids(key.0), &next).await?;

                for added in next.iter().filter(|id| !previous.contains(id)) {
                    self.increment_ref(*added).await?;
                }
                for removed in previous.iter().filter(|id| !next.contains(id)) {
                    self.decrement_ref(*removed).await?;
                }
                Ok(())
            }
            WriterMessage::ActivateQuery { query_def_id, key, max_count } => {
                let queue_key = persisted_keys::queue(query_def_id);
                let mut queue: KvBuffer = self.read_buffer(&queue_key).await?;
                let evicted = lru::touch(&mut queue, key.0, max_count);
                self.delegate.set_buffer(&queue_key, &queue).await?;
                if let Some(evicted_id) = evicted {
                    self.evict_query_value_only(evicted_id).await?;
                }
                Ok(())
            }
            WriterMessage::EvictQuery { query_def_id, key } => {
                let queue_key = persisted_keys::queue(query_def_id);
                let mut queue = self.read_buffer(&queue_key).await?;
                lru::remove(&mut queue, key.0);
                self.delegate.set_buffer(&queue_key, &queue).await?;
                self.evict_query_value_only(key.0).await
            }
            WriterMessage::ClearOptimisticInsertRefs { key } => {
                self.delegate.delete(&persisted_keys::optimistic_insert_refs(key.0)).await
            }
            WriterMessage::SetStreamOrphanRefs { key, orphan_refs } => {
                let buf: KvBuffer = orphan_refs.into_iter().map(|e| e.0).collect();
                self.delegate.set_buffer(&persisted_keys::stream_orphan_refs(key.0), &buf).await
            }
        }
    }
}

/// Keeps only the last `SaveQuery` per `QueryId` within `batch`, in the
/// position of its last occurrence; every other message passes through
/// unchanged and in its original order. Messages for distinct keys, and
/// every non-`SaveQuery` variant, are never reordered relative to each
/// other — only superseded `SaveQuery`s for the same key are dropped.
fn conflate(batch: Vec<WriterMessage>) -> Vec<WriterMessage> {
    let mut last_save_query_index: HashMap<QueryId, usize> = HashMap::new();
    for (i, message) in batch.iter().enumerate() {
        if let WriterMessage::SaveQuery { key, .. } = message {
            last_save_query_index.insert(*key, i);
        }
    }

    batch
        .into_iter()
        .enumerate()
        .filter(|(i, message)| match message {
            WriterMessage::SaveQuery { key, .. } => last_save_query_index.get(key) == Some(i),
            _ => true,
        })
        .map(|(_, message)| message)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use qcache_common::EntityId;

    fn save_query(key: u32, value: &str) -> WriterMessage {
        WriterMessage::SaveQuery {
            query_def_id: 1,
            key: QueryId(key),
            value: value.to_string(),
            updated_at: 0.0,
            ref_ids: Some(vec![]),
        }
    }

    #[test]
    fn conflate_keeps_only_the_last_save_query_per_key() {
        let batch = vec![save_query(1, "a1"), save_query(2, "b1"), save_query(1, "a2")];
        let result = conflate(batch);
        assert_eq!(result.len(), 2);
        assert!(matches!(&result[0], WriterMessage::SaveQuery { key, value, .. } if *key == QueryId(2) && value == "b1"));
        assert!(matches!(&result[1], WriterMessage::SaveQuery { key, value, .. } if *key == QueryId(1) && value == "a2"));
    }

    #[test]
    fn conflate_leaves_other_variants_untouched_and_in_order() {
        let batch = vec![
            save_query(1, "a1"),
            WriterMessage::SaveEntity { key: EntityId(9), value: "e".to_string(), ref_ids: None },
            WriterMessage::ActivateQuery { query_def_id: 1, key: QueryId(1), max_count: 50 },
            save_query(1, "a2"),
        ];
        let result = conflate(batch);
        assert_eq!(result.len(), 3);
        assert!(matches!(&result[0], WriterMessage::SaveEntity { .. }));
        assert!(matches!(&result[1], WriterMessage::ActivateQuery { .. }));
        assert!(matches!(&result[2], WriterMessage::SaveQuery { value, .. } if value == "a2"));
    }
}
