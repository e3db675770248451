//! Query Engine (§4.5): query definitions, cache options, and the
//! `QueryKey` hashing that lets two requesters with the same resolved
//! parameters share one [`instance::QueryInstance`].
//!
//! Submodules mirror the engine's moving parts: [`instance`] owns the
//! per-instance lifecycle/relay state; [`scheduler`] owns everything that
//! runs off a timer (debounce, the GCD refetch-interval clock, retry
//! backoff, two-generation memory eviction); [`infinite`] owns page
//! accumulation for `fetchNextPage`-shaped queries.

pub mod infinite;
pub mod instance;
pub mod scheduler;

pub use infinite::InfiniteState;
pub use instance::{QueryInstance, QueryStatus};
pub use scheduler::{DebounceScheduler, DebounceSlot, RefetchIntervalScheduler};

use crate::network::NetworkMode;
use qcache_common::{hash_query_key, PathParam, QueryId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// HTTP method a query definition issues its request with. Mutations reuse
/// the same enum (§4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// `retries` is a numeric count, or `{retries, retryDelay(attempt)->ms}`
/// (§4.5). Default exponential backoff `1000 * 2^attempt`; queries default
/// to zero retries when no window context is available (treated here as
/// the caller's responsibility — the engine itself defaults to the
/// exponential policy and callers wanting "no window" semantics pass
/// `RetryPolicy::none()`).
#[derive(Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub retry_delay: Arc<dyn Fn(u32) -> u64 + Send + Sync>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3)
    }
}

impl RetryPolicy {
    pub fn exponential(retries: u32) -> Self {
        Self {
            retries,
            retry_delay: Arc::new(|attempt| 1000u64 * 2u64.saturating_pow(attempt)),
        }
    }

    /// Mutations default to zero retries (§4.6).
    pub fn none() -> Self {
        Self {
            retries: 0,
            retry_delay: Arc::new(|_| 0),
        }
    }

    pub fn delay_ms(&self, attempt: u32) -> u64 {
        (self.retry_delay)(attempt)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy").field("retries", &self.retries).finish()
    }
}

/// `cache` options attached to a query definition (§4.5, §6 defaults).
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Age, in ms, under which a cached value is served without a
    /// background refetch. Default 0 (always-stale).
    pub stale_time_ms: f64,
    /// Delays parameter-change-triggered refetches by this many ms,
    /// collapsing repeats; the initial fetch is never debounced.
    pub debounce_ms: Option<u64>,
    pub retry: RetryPolicy,
    /// The base period, in ms, for the per-client GCD refetch-interval
    /// scheduler.
    pub refetch_interval_ms: Option<u64>,
    pub network_mode: NetworkMode,
    pub refresh_stale_on_reconnect: bool,
    pub max_count: usize,
    pub gc_time_ms: f64,
    /// Scales `refetch_interval_ms` for tests.
    pub refetch_multiplier: f64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            stale_time_ms: 0.0,
            debounce_ms: None,
            retry: RetryPolicy::default(),
            refetch_interval_ms: None,
            network_mode: NetworkMode::Online,
            refresh_stale_on_reconnect: true,
            max_count: crate::persistence::DEFAULT_MAX_COUNT,
            gc_time_ms: crate::persistence::DEFAULT_GC_TIME_MS,
            refetch_multiplier: 1.0,
        }
    }
}

/// A parametrized query's static shape: path template, method, optional
/// search-params/response schemas, cache options, and the optional
/// infinite/stream/optimistic-insert extensions (§4.5).
pub struct QueryDef {
    /// A process-wide stable identity for this definition — part of
    /// `QueryKey`. The Query Client assigns this once per builder identity
    /// (§4.7 "definitions are memoized per function identity").
    pub id: u64,
    pub path_template: &'static str,
    pub method: HttpMethod,
    pub response_def: crate::registry::TypeDef,
    pub cache: CacheOptions,
    /// Declared entity type accepted by `addOptimisticInsert`; `None` means
    /// optimistic inserts are not permitted on this definition (§4.5).
    pub optimistic_inserts_def: Option<crate::registry::TypeDef>,
    pub stream: Option<crate::registry::StreamDescriptor>,
    /// Present for infinite queries: evaluates the next page's params from
    /// the last parsed page, or `None` to halt.
    pub get_next_page_params: Option<Arc<dyn Fn(&serde_json::Value) -> Option<BTreeMap<String, PathParam>> + Send + Sync>>,
}

impl QueryDef {
    pub fn is_infinite(&self) -> bool {
        self.get_next_page_params.is_some()
    }
}

/// Resolved request parameters for one call: path params (consumed by
/// `path_template`) and search params (the remainder, sorted by name for
/// key stability).
#[derive(Clone, Debug, Default)]
pub struct QueryParams {
    pub path: BTreeMap<String, PathParam>,
    pub search: BTreeMap<String, String>,
}

impl QueryParams {
    /// Canonical string used for `QueryKey` hashing: path params resolved
    /// by `interpolate_path`, remaining search params sorted by name.
    pub fn canonical(&self, path_template: &str) -> Result<String, qcache_common::PathInterpolationError> {
        let (resolved_path, unused) = qcache_common::interpolate_path(path_template, &self.path)?;
        let mut parts = vec![resolved_path];
        for name in unused {
            if let Some(value) = self.search.get(&name) {
                parts.push(format!("{name}={value}"));
            }
        }
        for (name, value) in &self.search {
            if !parts.iter().any(|p| p.starts_with(&format!("{name}="))) {
                parts.push(format!("{name}={value}"));
            }
        }
        Ok(parts.join("&"))
    }
}

/// `hash(queryDefId, params)` after resolving path params and sorting
/// search params by name (§4.5 "Query key").
pub fn query_key(def: &QueryDef, params: &QueryParams) -> Result<QueryId, qcache_common::PathInterpolationError> {
    let canonical = params.canonical(def.path_template)?;
    Ok(hash_query_key(def.id, &canonical))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn def(id: u64) -> QueryDef {
        QueryDef {
            id,
            path_template: "/users/[id]",
            method: HttpMethod::Get,
            response_def: crate::registry::builders::object([]),
            cache: CacheOptions::default(),
            optimistic_inserts_def: None,
            stream: None,
            get_next_page_params: None,
        }
    }

    #[test]
    fn same_params_share_a_key() {
        let d = def(1);
        let mut params = QueryParams::default();
        params.path.insert("id".into(), PathParam::Segment("1".into()));
        let a = query_key(&d, &params).unwrap();
        let b = query_key(&d, &params).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn different_defs_never_collide_even_with_same_params() {
        let mut params = QueryParams::default();
        params.path.insert("id".into(), PathParam::Segment("1".into()));
        let a = query_key(&def(1), &params).unwrap();
        let b = query_key(&def(2), &params).unwrap();
        assert_ne!(a, b);
    }
}
