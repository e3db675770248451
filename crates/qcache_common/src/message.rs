//! The writer's message envelope (§4.4, §6 "Message channel").
//!
//! Readers never touch the delegate directly for writes; every mutating
//! operation is posted as a `WriterMessage` and processed by the writer's
//! single FIFO queue, one message fully completing (including cascading
//! ref-count work) before the next begins.

use crate::key::{EntityId, QueryId};
use serde::{Deserialize, Serialize};

/// A discriminated, strongly-typed substitute for the untagged writer
/// payloads of the source system.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WriterMessage {
    /// Persist a query's value, refreshing its `updatedAt` and diffing its
    /// ref-id set against whatever was previously stored for `key`.
    SaveQuery {
        query_def_id: u64,
        key: QueryId,
        value: String,
        updated_at: f64,
        ref_ids: Option<Vec<EntityId>>,
    },

    /// Persist a single entity's value (used for direct entity preloads and
    /// for stream-driven merges that should survive a restart), diffing
    /// `ref_ids` against the entity's previously persisted set the same way
    /// `SaveQuery` does for a query's ref-ids.
    SaveEntity {
        key: EntityId,
        value: String,
        ref_ids: Option<Vec<EntityId>>,
    },

    /// Touch a query family's LRU queue, moving `key` to the head and
    /// cascade-deleting the tail if the family now exceeds `max_count`.
    ActivateQuery {
        query_def_id: u64,
        key: QueryId,
        max_count: usize,
    },

    /// Remove a query from its family's LRU queue and cascade-delete its
    /// persisted state outright (used on explicit cache-clear, not eviction
    /// — eviction is driven by `ActivateQuery`'s capacity check).
    EvictQuery { query_def_id: u64, key: QueryId },

    /// Discard a query's optimistic-insert ref buffer (called on every
    /// refetch, per §4.5 "on refetch the optimistic insert set is cleared").
    ClearOptimisticInsertRefs { key: QueryId },

    /// Replace a query's stream-orphan ref buffer wholesale (reconciled on
    /// the next refetch per §4.5 "Entity-streams on queries").
    SetStreamOrphanRefs {
        key: QueryId,
        orphan_refs: Vec<EntityId>,
    },
}
