/// An entity's stream descriptor (`entity({...}, {stream: ...})`).
///
/// Carried on the schema rather than on a live query — any query whose
/// response schema includes an entity with a stream descriptor gets its
/// updates merged through `EntityStore::activate_stream` (§4.3, §4.5
/// "Entity-streams on queries").
#[derive(Clone)]
pub struct StreamDescriptor {
    /// A stable name, used for logging and for deduplicating subscriptions
    /// to the same logical stream across multiple live queries.
    pub name: &'static str,
}

impl std::fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDescriptor").field("name", &self.name).finish()
    }
}
