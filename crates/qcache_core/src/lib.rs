//! A normalized, reactive query cache: the client-side engine that mediates
//! between a reactive UI layer and external data sources (HTTP endpoints,
//! push streams, mutation endpoints).
//!
//! Built leaf-first, matching §2's dependency order:
//!
//! 1. [`registry`] — the Type Registry: a declarative schema of value
//!    shapes, producing a stable shape key per definition.
//! 2. [`parser`] / [`proxy`] — validate raw JSON against a schema, discover
//!    entities, and mint reactive proxies over them.
//! 3. [`entity_store`] — the in-memory normalized store.
//! 4. [`persistence`] — the two-tier Query Store (sync delegate, or an
//!    async writer/reader split over a channel).
//! 5. [`query`] — the Query Engine: query instances, lifecycle, retry,
//!    debounce, refetch-interval scheduling, pagination, stream queries.
//! 6. [`mutation`] — the Mutation Engine: optimistic updates and revert.
//! 7. [`client`] — the Query Client façade tying all of the above together.

pub mod client;
pub mod entity_store;
pub mod error;
pub mod mask;
pub mod mutation;
pub mod network;
pub mod parser;
pub mod persistence;
pub mod proxy;
pub mod query;
pub mod registry;

pub use error::{ConfigurationError, ContextError, MutationError, QueryError, StreamError, TransportError, ValidationError};
pub use mask::Mask;
