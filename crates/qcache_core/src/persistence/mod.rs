//! Persistence Layer / Query Store (§4.4): two concrete configurations
//! sharing one admission policy ([`lru`]) and one key layout
//! (`qcache_common::persisted_keys`).
//!
//! [`sync_store::SyncQueryStore`] runs every operation inline against a
//! blocking [`qcache_common::KvDelegate`]. [`writer::QueryStoreWriter`] /
//! [`reader::QueryStoreReader`] split the same operations across a
//! writer-owned FIFO message queue and read-only reader endpoints, for an
//! async [`qcache_common::AsyncKvDelegate`].

pub mod lru;
pub mod reader;
pub mod sync_store;
pub mod writer;

pub use reader::QueryStoreReader;
pub use sync_store::{SyncQueryStore, DEFAULT_GC_TIME_MS, DEFAULT_MAX_COUNT};
pub use writer::{QueryStoreWriter, WriterHandle};
