use thiserror::Error;

/// The writer caught an exception from the delegate. Logged and the queue
/// moves to the next message; in-memory state is never touched by a
/// storage failure.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    #[error("key/value delegate failed on `{key}`: {reason}")]
    Delegate { key: String, reason: String },

    #[error("stored value for `{key}` could not be decoded: {reason}")]
    Decode { key: String, reason: String },

    #[error("the write queue's channel to the writer endpoint was closed")]
    ChannelClosed,
}
