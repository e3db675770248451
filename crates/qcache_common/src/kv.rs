//! The persistent key/value delegate contract (§6, "Persistent KV delegate").
//!
//! Only the interface is specified here; the concrete storage engine behind
//! it (disk, IndexedDB-equivalent, in-memory map) is a consumer concern.

use crate::error::StorageError;
use std::future::Future;

/// The buffer value type used for ref-id sets and LRU queues.
pub type KvBuffer = Vec<u32>;

/// Blocking KV delegate, consumed directly by the synchronous query store.
/// Unlike [`AsyncKvDelegate`], this is called inline from the single-threaded
/// cooperative engine (§5) and carries no `Send`/`Sync` bound — a delegate
/// backed by `Rc`/`RefCell` is expected, not just permitted.
pub trait KvDelegate {
    fn has(&self, key: &str) -> bool;
    fn get_string(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn get_number(&self, key: &str) -> Result<Option<f64>, StorageError>;
    fn get_buffer(&self, key: &str) -> Result<Option<KvBuffer>, StorageError>;
    fn set_string(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn set_number(&self, key: &str, value: f64) -> Result<(), StorageError>;
    fn set_buffer(&self, key: &str, value: &KvBuffer) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Async KV delegate, owned exclusively by the writer endpoint of the
/// asynchronous query store. Readers hold a delegate only for direct reads
/// of confirmed state; they must never call the mutating methods.
///
/// The writer and reader are generic over this trait rather than boxing it
/// as `dyn` — there is exactly one delegate implementation per client, known
/// at construction time.
pub trait AsyncKvDelegate: Send + Sync + 'static {
    fn has(&self, key: &str) -> impl Future<Output = bool> + Send;
    fn get_string(&self, key: &str) -> impl Future<Output = Result<Option<String>, StorageError>> + Send;
    fn get_number(&self, key: &str) -> impl Future<Output = Result<Option<f64>, StorageError>> + Send;
    fn get_buffer(&self, key: &str) -> impl Future<Output = Result<Option<KvBuffer>, StorageError>> + Send;
    fn set_string(&self, key: &str, value: &str) -> impl Future<Output = Result<(), StorageError>> + Send;
    fn set_number(&self, key: &str, value: f64) -> impl Future<Output = Result<(), StorageError>> + Send;
    fn set_buffer(&self, key: &str, value: &KvBuffer) -> impl Future<Output = Result<(), StorageError>> + Send;
    fn delete(&self, key: &str) -> impl Future<Output = Result<(), StorageError>> + Send;
}
