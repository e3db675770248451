//! Entity and query identity hashing.
//!
//! Both identities are 32-bit: the persisted buffer type (`sq:doc:refIds:<id>`
//! and friends) is an unsigned-32 array, so keys are truncated to `u32` at
//! the hashing boundary rather than carried as full 64-bit hashes.

use std::hash::{DefaultHasher, Hash, Hasher};

/// Identifies a single normalized entity: `hash([typename + ":" + id, shapeKey])`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, serde::Serialize, serde::Deserialize)]
pub struct EntityId(pub u32);

/// Identifies a parametrized query instance: `hash(queryDefId, params)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, serde::Serialize, serde::Deserialize)]
pub struct QueryId(pub u32);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn hash64(hashable: impl Hash) -> u64 {
    let mut hasher = DefaultHasher::new();
    hashable.hash(&mut hasher);
    hasher.finish()
}

fn truncate(h: u64) -> u32 {
    (h ^ (h >> 32)) as u32
}

/// `EntityKey = hash([typenameValue + ":" + idValue, shapeKey])`.
///
/// Two otherwise-equal entities parsed through different schema projections
/// (different `shape_key`) land at different keys on purpose — a cache hit
/// across projections would leak fields a narrower schema never declared.
pub fn hash_entity_key(typename_value: &str, id_value: &str, shape_key: u64) -> EntityId {
    let identity = format!("{}:{}", typename_value, id_value);
    EntityId(truncate(hash64((identity, shape_key))))
}

/// `QueryKey = hash(queryDefId, params)`.
///
/// `params` must already be canonicalized by the caller (path params
/// resolved, search params sorted by name) so that two requesters yielding
/// the same logical query collapse onto the same key.
pub fn hash_query_key(query_def_id: u64, canonical_params: &str) -> QueryId {
    QueryId(truncate(hash64((query_def_id, canonical_params))))
}

/// Stable hash of a canonical shape representation, used as `TypeDef::shape_key`.
pub fn hash_shape(canonical_shape: &str) -> u64 {
    hash64(canonical_shape)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_produce_same_key() {
        let a = hash_entity_key("User", "1", 42);
        let b = hash_entity_key("User", "1", 42);
        assert_eq!(a, b);
    }

    #[test]
    fn different_shape_key_isolates_cache() {
        let a = hash_entity_key("User", "1", 42);
        let b = hash_entity_key("User", "1", 43);
        assert_ne!(a, b);
    }

    #[test]
    fn query_key_is_stable_per_params() {
        let a = hash_query_key(7, "id=1");
        let b = hash_query_key(7, "id=1");
        let c = hash_query_key(7, "id=2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
