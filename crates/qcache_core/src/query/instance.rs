//! The per-parametrized-query relay (§4.5 "Lifecycle state").
//!
//! One [`QueryInstance`] is shared by every requester that resolves to the
//! same [`super::query_key`]; repeated calls during its lifetime return the
//! same relay rather than launching a second fetch. State lives in
//! `reactive_graph` signals so a reactive consumer's read of `value()` (or
//! any of the `is_*` accessors) is automatically a dependency of this
//! instance's fetch cycle.

use crate::entity_store::{EntityStore, Unsubscribe};
use crate::error::{QueryError, StreamError, TransportError};
use crate::network::{should_pause, NetworkManager};
use crate::parser::{parse_entities, FormatterRegistry};
use crate::query::infinite::InfiniteState;
use crate::query::QueryDef;
use crate::registry::StreamDescriptor;
use qcache_common::EntityId;
use reactive_graph::owner::StoredValue;
use reactive_graph::prelude::*;
use reactive_graph::signal::RwSignal;
use serde_json::Value;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// §4.5 "Lifecycle state of a query instance".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryStatus {
    Idle,
    Pending,
    Resolved,
    Rejected,
    Paused,
}

/// Anything capable of executing one query request and handing back a raw
/// JSON body — the stand-in for §6's HTTP fetcher external interface.
/// `Box<dyn Error>` rather than `TransportError` directly, so callers can
/// wrap arbitrary transport failures (a thrown fetcher, a non-2xx status)
/// without this trait depending on the concrete error enum's variants.
pub trait QueryFetcher {
    fn fetch(&self, method: &'static str, path: &str) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, TransportError>>>>;

    /// Opens a push subscription for a query definition's stream descriptor
    /// (§4.5 "Entity-streams on queries"), invoking `on_update` with every
    /// pushed raw body. Defaults to rejecting — only a fetcher with an
    /// actual live transport needs to override this.
    fn subscribe(&self, descriptor: &StreamDescriptor, _on_update: Box<dyn Fn(Value)>) -> Result<Unsubscribe, StreamError> {
        Err(StreamError {
            reason: format!("fetcher does not support streaming (descriptor `{}`)", descriptor.name),
        })
    }
}

struct InnerState {
    status: RwSignal<QueryStatus>,
    value: RwSignal<Option<Value>>,
    error: RwSignal<Option<QueryError>>,
    updated_at: RwSignal<Option<f64>>,
    is_fetching: RwSignal<bool>,
    is_refetching: RwSignal<bool>,
    ref_ids: RwSignal<Vec<EntityId>>,
    stream_orphan_refs: RwSignal<Vec<EntityId>>,
    optimistic_insert_refs: RwSignal<Vec<EntityId>>,
    infinite: Option<RwSignal<InfiniteState>>,
    /// Set by `activate_stream`; cancelled by `deactivate_stream` or when a
    /// second `activate_stream` call finds one already running.
    stream_unsubscribe: RefCell<Option<Unsubscribe>>,
    /// Bumped on every `refetch()`/background-fetch launch; an in-flight
    /// fetch checks its captured generation before committing a result so a
    /// stale response never clobbers a newer one (§5 "only one fetch
    /// outstanding per instance").
    generation: Cell<u64>,
}

/// The in-memory live object for one parametrized query call (§ GLOSSARY
/// "Query instance").
#[derive(Clone)]
pub struct QueryInstance {
    key: qcache_common::QueryId,
    state: Rc<InnerState>,
    watcher_count: StoredValue<u32>,
}

impl QueryInstance {
    pub fn new(key: qcache_common::QueryId, infinite: bool) -> Self {
        Self {
            key,
            state: Rc::new(InnerState {
                status: RwSignal::new(QueryStatus::Idle),
                value: RwSignal::new(None),
                error: RwSignal::new(None),
                updated_at: RwSignal::new(None),
                is_fetching: RwSignal::new(false),
                is_refetching: RwSignal::new(false),
                ref_ids: RwSignal::new(Vec::new()),
                stream_orphan_refs: RwSignal::new(Vec::new()),
                optimistic_insert_refs: RwSignal::new(Vec::new()),
                infinite: if infinite { Some(RwSignal::new(InfiniteState::default())) } else { None },
                stream_unsubscribe: RefCell::new(None),
                generation: Cell::new(0),
            }),
            watcher_count: StoredValue::new(0),
        }
    }

    pub fn key(&self) -> qcache_common::QueryId {
        self.key
    }

    // -- relay/promise surface (§4.5) ---------------------------------

    pub fn value(&self) -> Option<Value> {
        self.state.value.get()
    }

    pub fn error(&self) -> Option<QueryError> {
        self.state.error.get()
    }

    pub fn status(&self) -> QueryStatus {
        self.state.status.get()
    }

    pub fn updated_at(&self) -> Option<f64> {
        self.state.updated_at.get()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == QueryStatus::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.status() == QueryStatus::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.status() == QueryStatus::Rejected
    }

    pub fn is_paused(&self) -> bool {
        self.status() == QueryStatus::Paused
    }

    pub fn is_ready(&self) -> bool {
        self.value().is_some()
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status(), QueryStatus::Resolved | QueryStatus::Rejected)
    }

    pub fn is_fetching(&self) -> bool {
        self.state.is_fetching.get()
    }

    pub fn is_refetching(&self) -> bool {
        self.state.is_refetching.get()
    }

    pub fn ref_ids(&self) -> Vec<EntityId> {
        self.state.ref_ids.get()
    }

    pub fn has_next_page(&self) -> bool {
        self.state.infinite.map(|s| s.get().next_page_params.is_some()).unwrap_or(false)
    }

    pub fn is_fetching_more(&self) -> bool {
        self.state.infinite.map(|s| s.get().is_fetching_more).unwrap_or(false)
    }

    // -- watcher lifecycle (§4.5 "deactivated when watcher count falls to zero") --

    pub fn watch(&self) {
        self.watcher_count.update_value(|c| *c += 1);
    }

    /// Returns `true` once the last watcher has dropped — the caller
    /// schedules deactivation.
    pub fn unwatch(&self) -> bool {
        self.watcher_count.update_value(|c| *c = c.saturating_sub(1));
        self.watcher_count.get_value() == 0
    }

    pub fn watcher_count(&self) -> u32 {
        self.watcher_count.get_value()
    }

    // -- stale-time (§4.5 "Stale-time") --------------------------------

    /// `true` when `updated_at + stale_time_ms <= now_ms` — an access
    /// should schedule a background refetch on top of serving the cached
    /// value.
    pub fn is_stale(&self, now_ms: f64, stale_time_ms: f64) -> bool {
        match self.state.updated_at.get_untracked() {
            Some(updated_at) => now_ms - updated_at > stale_time_ms,
            None => true,
        }
    }

    /// Clears `updated_at` so the next `is_stale` check reports stale
    /// regardless of `stale_time_ms` — the Query Client's `invalidate`/
    /// `invalidate_all` (supplemented, see SPEC_FULL.md).
    pub fn mark_stale(&self) {
        self.state.updated_at.set(None);
    }

    fn begin_generation(&self) -> u64 {
        let next = self.state.generation.get() + 1;
        self.state.generation.set(next);
        next
    }

    fn is_current_generation(&self, generation: u64) -> bool {
        self.state.generation.get() == generation
    }

    /// Core fetch/retry cycle. `is_background` distinguishes a
    /// stale-while-revalidate refetch (keeps serving the previous value,
    /// `is_refetching = true`) from the first fetch (`Pending`, no prior
    /// value to show).
    pub async fn run_fetch<F: QueryFetcher>(
        &self,
        def: &QueryDef,
        path: &str,
        fetcher: &F,
        entity_store: &EntityStore,
        formatters: &FormatterRegistry,
        network: &NetworkManager,
        is_background: bool,
    ) {
        self.run_fetch_inner(def, path, fetcher, entity_store, formatters, network, is_background, false).await
    }

    /// As [`Self::run_fetch`], but accumulates the response as the next
    /// page of an infinite query instead of replacing page one.
    pub async fn run_fetch_next_page<F: QueryFetcher>(
        &self,
        def: &QueryDef,
        path: &str,
        fetcher: &F,
        entity_store: &EntityStore,
        formatters: &FormatterRegistry,
        network: &NetworkManager,
    ) {
        self.mark_fetching_more(true);
        self.run_fetch_inner(def, path, fetcher, entity_store, formatters, network, true, true).await
    }

    async fn run_fetch_inner<F: QueryFetcher>(
        &self,
        def: &QueryDef,
        path: &str,
        fetcher: &F,
        entity_store: &EntityStore,
        formatters: &FormatterRegistry,
        network: &NetworkManager,
        is_background: bool,
        is_next_page: bool,
    ) {
        let generation = self.begin_generation();
        let has_value = self.state.value.get_untracked().is_some();

        if should_pause(def.cache.network_mode, network.is_online_untracked(), has_value) {
            self.state.status.set(QueryStatus::Paused);
            return;
        }

        if is_background {
            self.state.is_refetching.set(true);
        } else {
            self.state.status.set(QueryStatus::Pending);
        }
        self.state.is_fetching.set(true);

        let mut attempt = 0u32;
        let outcome = loop {
            if !network.is_online_untracked() {
                // offline transitions cancel in-progress retry waits (§5 "Cancellation")
                break Err(QueryError::Transport(TransportError::Failed {
                    url: path.to_string(),
                    reason: "offline".to_string(),
                }));
            }
            match fetcher.fetch(def.method.as_str(), path).await {
                Ok(raw) => break self.apply_response(&raw, def, entity_store, formatters, is_next_page),
                Err(err) => {
                    if attempt >= def.cache.retry.retries {
                        break Err(QueryError::Transport(err));
                    }
                    let delay = def.cache.retry.delay_ms(attempt);
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
        };

        if !self.is_current_generation(generation) {
            // superseded by a newer refetch/refetch() call; drop this result
            return;
        }

        self.state.is_fetching.set(false);
        self.state.is_refetching.set(false);

        match outcome {
            Ok((parsed, refs)) => {
                self.state.value.set(Some(parsed));
                self.state.error.set(None);
                self.state.ref_ids.set(refs.clone());
                self.state.updated_at.set(Some(now_ms()));
                self.state.status.set(QueryStatus::Resolved);

                // an optimistic insert whose key now appears in the parsed
                // refs is reconciled away (§4.5 "optimistic insert ... is
                // auto-removed")
                self.state.optimistic_insert_refs.update(|ids| ids.retain(|id| !refs.contains(id)));
                if is_background {
                    self.state.optimistic_insert_refs.set(Vec::new());
                }
            }
            Err(err) => {
                self.state.error.set(Some(err));
                self.state.status.set(QueryStatus::Rejected);
            }
        }
    }

    fn apply_response(
        &self,
        raw: &Value,
        def: &QueryDef,
        entity_store: &EntityStore,
        formatters: &FormatterRegistry,
        is_next_page: bool,
    ) -> Result<(Value, Vec<EntityId>), QueryError> {
        let (parsed, refs) = parse_entities(raw, &def.response_def, entity_store, formatters).map_err(QueryError::Validation)?;

        if let Some(infinite) = self.state.infinite {
            let next_page_params = def.get_next_page_params.as_ref().and_then(|f| f(&parsed));
            infinite.update(|s| {
                if !is_next_page {
                    // first page of a fresh load, or a full revalidation: restart accumulation
                    s.pages.clear();
                }
                s.pages.push(parsed.clone());
                s.next_page_params = next_page_params;
                s.is_fetching_more = false;
            });
            let combined = Value::Array(infinite.get_untracked().pages.clone());
            return Ok((combined, refs));
        }

        Ok((parsed, refs))
    }

    /// The path params for the next page, evaluated by
    /// `getNextPageParams(lastPage)` when the previous fetch completed, or
    /// `None` if pagination has halted. The client resolves this into a
    /// concrete path and drives a normal `run_fetch(..., is_background:
    /// false)` call so the response accumulates through [`Self::apply_response`]
    /// the same way a first page does.
    pub fn next_page_params(&self) -> Option<std::collections::BTreeMap<String, qcache_common::PathParam>> {
        self.state.infinite.and_then(|s| s.get_untracked().next_page_params.clone())
    }

    pub fn mark_fetching_more(&self, fetching: bool) {
        if let Some(infinite) = self.state.infinite {
            infinite.update(|s| s.is_fetching_more = fetching);
        }
    }

    pub fn pages(&self) -> Vec<Value> {
        self.state.infinite.map(|s| s.get().pages).unwrap_or_default()
    }

    // -- optimistic inserts (§4.5 "Optimistic inserts") ------------------

    /// Overlays `key` on this query's result for reactive consumers. Rejects
    /// with a configuration error if `def` never declared
    /// `optimisticInserts`; otherwise a no-op if `key` already appears in the
    /// parsed refs.
    pub fn add_optimistic_insert(&self, def: &QueryDef, key: EntityId) -> Result<(), crate::error::ConfigurationError> {
        if def.optimistic_inserts_def.is_none() {
            return Err(crate::error::ConfigurationError::new("this query definition does not declare optimisticInserts"));
        }
        if self.state.ref_ids.get_untracked().contains(&key) {
            return Ok(());
        }
        self.state.optimistic_insert_refs.update(|ids| {
            if !ids.contains(&key) {
                ids.push(key);
            }
        });
        Ok(())
    }

    pub fn optimistic_insert_refs(&self) -> Vec<EntityId> {
        self.state.optimistic_insert_refs.get()
    }

    pub fn clear_optimistic_inserts(&self) {
        self.state.optimistic_insert_refs.set(Vec::new());
    }

    // -- stream queries / entity-streams-on-queries (§4.5) ---------------

    /// Merges a push-delivered value through the same parse/normalize path
    /// a fetch response takes. Entities already reachable from the query's
    /// last parsed refs merge directly; anything else becomes a stream
    /// orphan, visible to consumers and reconciled on the next refetch.
    pub fn apply_stream_update(&self, raw: &Value, def: &QueryDef, entity_store: &EntityStore, formatters: &FormatterRegistry) {
        let Ok((parsed, refs)) = parse_entities(raw, &def.response_def, entity_store, formatters) else {
            return;
        };
        let known = self.state.ref_ids.get_untracked();
        let mut orphans = self.state.stream_orphan_refs.get_untracked();
        for r in &refs {
            if !known.contains(r) && !orphans.contains(r) {
                orphans.push(*r);
            }
        }
        self.state.stream_orphan_refs.set(orphans);
        self.state.value.set(Some(parsed));
        self.state.updated_at.set(Some(now_ms()));
    }

    /// Restores a previously persisted `(value, updated_at, ref_ids)` triple
    /// without running a fetch — the Query Client's rehydration path on
    /// first in-process observation of a query (§4.4 "on load, preload into
    /// the entity store").
    pub fn hydrate(&self, value: Value, updated_at: f64, ref_ids: Vec<EntityId>) {
        self.state.value.set(Some(value));
        self.state.updated_at.set(Some(updated_at));
        self.state.ref_ids.set(ref_ids);
        self.state.status.set(QueryStatus::Resolved);
    }

    pub fn stream_orphan_refs(&self) -> Vec<EntityId> {
        self.state.stream_orphan_refs.get()
    }

    pub fn clear_stream_orphans(&self) {
        self.state.stream_orphan_refs.set(Vec::new());
    }

    /// Opens `def`'s push subscription, if it declares one, routing every
    /// pushed body through [`Self::apply_stream_update`]. A no-op if
    /// already active or if `def` carries no stream descriptor; a fetcher
    /// that rejects the subscribe call leaves the instance unsubscribed
    /// without surfacing an error (the initial fetch/cache result still
    /// stands on its own).
    pub fn activate_stream<F: QueryFetcher>(&self, def: &Rc<QueryDef>, fetcher: &F, entity_store: &EntityStore, formatters: &FormatterRegistry) {
        let Some(descriptor) = def.stream.clone() else {
            return;
        };
        if self.state.stream_unsubscribe.borrow().is_some() {
            return;
        }

        let instance = self.clone();
        let def = Rc::clone(def);
        let entity_store = *entity_store;
        let formatters = (*formatters).clone();
        let on_update: Box<dyn Fn(Value)> = Box::new(move |raw| {
            instance.apply_stream_update(&raw, &def, &entity_store, &formatters);
        });

        if let Ok(unsubscribe) = fetcher.subscribe(&descriptor, on_update) {
            *self.state.stream_unsubscribe.borrow_mut() = Some(unsubscribe);
        }
    }

    /// Cancels a stream opened by `activate_stream`, if one is active.
    pub fn deactivate_stream(&self) {
        if let Some(unsubscribe) = self.state.stream_unsubscribe.borrow_mut().take() {
            unsubscribe();
        }
    }
}

fn now_ms() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{CacheOptions, HttpMethod};
    use crate::registry::builders;
    use std::cell::RefCell;

    struct StaticFetcher {
        responses: RefCell<Vec<Result<Value, TransportError>>>,
    }

    impl QueryFetcher for StaticFetcher {
        fn fetch(&self, _method: &'static str, _path: &str) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, TransportError>>>> {
            let next = self.responses.borrow_mut().pop().unwrap_or_else(|| {
                Err(TransportError::Failed { url: "".into(), reason: "exhausted".into() })
            });
            Box::pin(async move { next })
        }
    }

    fn user_def(cache: CacheOptions) -> QueryDef {
        QueryDef {
            id: 1,
            path_template: "/users/[id]",
            method: HttpMethod::Get,
            response_def: builders::entity("User", [("typename", builders::typename("User")), ("id", builders::id()), ("name", builders::string())], None),
            cache,
            optimistic_inserts_def: None,
            stream: None,
            get_next_page_params: None,
        }
    }

    #[tokio::test]
    async fn successful_fetch_resolves_with_parsed_value() {
        let instance = QueryInstance::new(qcache_common::QueryId(1), false);
        let def = user_def(CacheOptions::default());
        let fetcher = StaticFetcher {
            responses: RefCell::new(vec![Ok(serde_json::json!({"typename": "User", "id": "1", "name": "Alice"}))]),
        };
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();
        let network = NetworkManager::new();

        instance.run_fetch(&def, "/users/1", &fetcher, &store, &formatters, &network, false).await;
        assert!(instance.is_resolved());
        assert_eq!(instance.ref_ids().len(), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let mut cache = CacheOptions::default();
        cache.retry = crate::query::RetryPolicy { retries: 2, retry_delay: std::sync::Arc::new(|_| 0) };
        let instance = QueryInstance::new(qcache_common::QueryId(2), false);
        let def = user_def(cache);
        // responses popped in reverse — success first pop is the last element
        let fetcher = StaticFetcher {
            responses: RefCell::new(vec![
                Ok(serde_json::json!({"typename": "User", "id": "1", "name": "Alice"})),
                Err(TransportError::Failed { url: "".into(), reason: "boom".into() }),
            ]),
        };
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();
        let network = NetworkManager::new();
        instance.run_fetch(&def, "/users/1", &fetcher, &store, &formatters, &network, false).await;
        assert!(instance.is_resolved());
    }

    #[tokio::test]
    async fn offline_pauses_instead_of_fetching() {
        let instance = QueryInstance::new(qcache_common::QueryId(3), false);
        let def = user_def(CacheOptions::default());
        let fetcher = StaticFetcher { responses: RefCell::new(vec![]) };
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();
        let network = NetworkManager::new();
        network.set_network_status(false);
        instance.run_fetch(&def, "/users/1", &fetcher, &store, &formatters, &network, false).await;
        assert!(instance.is_paused());
    }

    #[tokio::test]
    async fn optimistic_insert_is_noop_if_already_in_refs() {
        let instance = QueryInstance::new(qcache_common::QueryId(4), false);
        let mut def = user_def(CacheOptions::default());
        def.optimistic_inserts_def = Some(builders::entity("User", [("typename", builders::typename("User")), ("id", builders::id()), ("name", builders::string())], None));
        let fetcher = StaticFetcher {
            responses: RefCell::new(vec![Ok(serde_json::json!({"typename": "User", "id": "1", "name": "Alice"}))]),
        };
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();
        let network = NetworkManager::new();
        instance.run_fetch(&def, "/users/1", &fetcher, &store, &formatters, &network, false).await;
        let key = instance.ref_ids()[0];
        instance.add_optimistic_insert(&def, key).unwrap();
        assert!(instance.optimistic_insert_refs().is_empty());
    }

    #[tokio::test]
    async fn optimistic_insert_is_rejected_when_the_definition_does_not_declare_it() {
        let instance = QueryInstance::new(qcache_common::QueryId(5), false);
        let def = user_def(CacheOptions::default());
        let err = instance.add_optimistic_insert(&def, EntityId(99)).unwrap_err();
        assert!(err.reason.contains("optimisticInserts"));
    }

    #[derive(Default)]
    struct StreamingFetcher {
        captured: RefCell<Option<Box<dyn Fn(Value)>>>,
        subscribe_calls: Cell<u32>,
    }

    impl QueryFetcher for StreamingFetcher {
        fn fetch(&self, _method: &'static str, _path: &str) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, TransportError>>>> {
            Box::pin(async { Err(TransportError::Failed { url: "".into(), reason: "not used".into() }) })
        }

        fn subscribe(&self, _descriptor: &crate::registry::StreamDescriptor, on_update: Box<dyn Fn(Value)>) -> Result<crate::entity_store::Unsubscribe, crate::error::StreamError> {
            self.subscribe_calls.set(self.subscribe_calls.get() + 1);
            *self.captured.borrow_mut() = Some(on_update);
            Ok(Box::new(|| {}))
        }
    }

    #[test]
    fn activate_stream_routes_pushed_updates_through_apply_stream_update() {
        let instance = QueryInstance::new(qcache_common::QueryId(6), false);
        let mut def = user_def(CacheOptions::default());
        def.stream = Some(crate::registry::StreamDescriptor { name: "users" });
        let def = Rc::new(def);
        let fetcher = StreamingFetcher::default();
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();

        instance.activate_stream(&def, &fetcher, &store, &formatters);
        // a second call with an already-open subscription must not reopen it.
        instance.activate_stream(&def, &fetcher, &store, &formatters);
        assert_eq!(fetcher.subscribe_calls.get(), 1);

        let on_update = fetcher.captured.borrow_mut().take().unwrap();
        on_update(serde_json::json!({"typename": "User", "id": "1", "name": "Pushed"}));

        assert_eq!(instance.value().unwrap()["name"], "Pushed");
        instance.deactivate_stream();
    }
}
