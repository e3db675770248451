//! Stable, produced key layout (§6 "Persisted layout").
//!
//! `id` is the 32-bit unsigned integer hash of the entity or query (see
//! [`crate::key`]); `queryDefId` is the 64-bit identity of a query
//! definition, printed in hex so family keys don't collide with id-indexed
//! keys sharing the same decimal digits.

pub fn value(id: u32) -> String {
    format!("sq:doc:value:{id}")
}

pub fn updated_at(id: u32) -> String {
    format!("sq:doc:updatedAt:{id}")
}

pub fn ref_ids(id: u32) -> String {
    format!("sq:doc:refIds:{id}")
}

pub fn ref_count(id: u32) -> String {
    format!("sq:doc:refCount:{id}")
}

pub fn stream_orphan_refs(id: u32) -> String {
    format!("sq:doc:streamOrphanRefs:{id}")
}

pub fn optimistic_insert_refs(id: u32) -> String {
    format!("sq:doc:optimisticInsertRefs:{id}")
}

pub fn queue(query_def_id: u64) -> String {
    format!("sq:doc:queue:{query_def_id:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_the_produced_layout() {
        assert_eq!(value(7), "sq:doc:value:7");
        assert_eq!(updated_at(7), "sq:doc:updatedAt:7");
        assert_eq!(ref_ids(7), "sq:doc:refIds:7");
        assert_eq!(ref_count(7), "sq:doc:refCount:7");
        assert_eq!(stream_orphan_refs(7), "sq:doc:streamOrphanRefs:7");
        assert_eq!(optimistic_insert_refs(7), "sq:doc:optimisticInsertRefs:7");
        assert_eq!(queue(42), "sq:doc:queue:2a");
    }
}
