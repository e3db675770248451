//! Wire-level building blocks shared between the persistence writer and its
//! reader endpoints: entity/query key hashing, path-template interpolation,
//! the key/value delegate contracts, persisted key naming, and the message
//! envelope readers post to the writer's single FIFO queue.

pub mod error;
pub mod key;
pub mod kv;
pub mod message;
pub mod path;
pub mod persisted_keys;

pub use error::StorageError;
pub use key::{hash_entity_key, hash_query_key, hash_shape, EntityId, QueryId};
pub use kv::{AsyncKvDelegate, KvBuffer, KvDelegate};
pub use message::WriterMessage;
pub use path::{interpolate_path, PathInterpolationError, PathParam};
