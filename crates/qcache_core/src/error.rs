//! Error kinds surfaced through a query instance's or mutation task's
//! promise-equivalent state (§7).

use thiserror::Error;

pub use qcache_common::StorageError;

/// The parser's schema-mismatch error. Carries the breadcrumb to the failing
/// position, what was expected, and a short summary of what was received.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("validation failed at `{path}`: expected {expected}, got {got}")]
pub struct ValidationError {
    pub path: String,
    pub expected: String,
    pub got: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, expected: impl Into<String>, got: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// A non-2xx response, or the fetcher itself returning an error. Subject to
/// the query/mutation's retry policy.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("request to `{url}` failed with status {status}")]
    Status { url: String, status: u16 },
    #[error("request to `{url}` failed: {reason}")]
    Failed { url: String, reason: String },
}

/// The fetcher's `json()` decode step threw.
#[derive(Debug, Clone, Error)]
#[error("failed to decode response body as JSON: {reason}")]
pub struct ParseJsonError {
    pub reason: String,
}

/// A stream query's subscribe function threw. Not retried automatically.
#[derive(Debug, Clone, Error)]
#[error("stream subscription failed: {reason}")]
pub struct StreamError {
    pub reason: String,
}

/// Attempted to resolve a query/mutation outside of a Query Client scope.
/// Raised at the call site, before any task is created.
#[derive(Debug, Clone, Error)]
#[error("no QueryClient is in scope")]
pub struct ContextError;

/// A synchronous, call-site configuration mistake (e.g. an optimistic insert
/// on a query whose definition does not declare `optimisticInserts`).
#[derive(Debug, Clone, Error)]
#[error("configuration error: {reason}")]
pub struct ConfigurationError {
    pub reason: String,
}

impl ConfigurationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// The union of everything a query instance's lifecycle can fail with.
#[derive(Debug, Clone, Error)]
pub enum QueryError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    ParseJson(#[from] ParseJsonError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// The union of everything a mutation task can fail with.
#[derive(Debug, Clone, Error)]
pub enum MutationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    ParseJson(#[from] ParseJsonError),
}
