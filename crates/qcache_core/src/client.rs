//! Query Client (§4.7): the façade. Holds the Entity Store, the Query
//! Store, the `NetworkManager`, and the registries of live query/mutation
//! instances; resolves a query/mutation call into a shared relay; dispatches
//! memory eviction of idle instances.
//!
//! Generic over `F` (a combined query+mutation fetcher, §6) and `K` (the
//! synchronous KV delegate backing persistence, §4.4). A client built over
//! the asynchronous writer/reader split is assembled by hand from
//! [`crate::persistence::QueryStoreWriter`] / [`QueryStoreReader`] directly
//! — those two already carry their own ordering guarantees independent of
//! this façade.

use crate::entity_store::EntityStore;
use crate::error::{ConfigurationError, ContextError};
use crate::mutation::{MutationDef, MutationFetcher, MutationTask};
use crate::network::NetworkManager;
use crate::parser::FormatterRegistry;
use crate::persistence::sync_store::SyncQueryStore;
use crate::query::instance::QueryFetcher;
use crate::query::scheduler::{DebounceScheduler, DebounceSlot, RefetchIntervalScheduler};
use crate::query::{query_key, QueryDef, QueryInstance, QueryParams};
use qcache_common::{interpolate_path, EntityId, KvDelegate, PathParam, QueryId};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

/// Two-generation rotating-set eviction manager (§4.7): `schedule` puts a
/// key in the *next* bucket so it survives at least one full interval;
/// `cancel` removes it from both; each tick evicts the current bucket and
/// rotates.
#[derive(Default)]
struct EvictionManager {
    current: HashSet<QueryId>,
    next: HashSet<QueryId>,
}

impl EvictionManager {
    fn schedule(&mut self, key: QueryId) {
        self.next.insert(key);
    }

    fn cancel(&mut self, key: QueryId) {
        self.current.remove(&key);
        self.next.remove(&key);
    }

    /// Evicts the current bucket and rotates `next` into `current`.
    /// Returns the keys evicted this tick.
    fn tick(&mut self) -> Vec<QueryId> {
        let evicted: Vec<QueryId> = self.current.iter().copied().collect();
        self.current = std::mem::take(&mut self.next);
        evicted
    }
}

pub const DEFAULT_EVICTION_INTERVAL_MS: u64 = 60_000;

/// Resolves a query function call to its definition, memoizing per builder
/// identity (§4.7). `register_query`/`register_mutation` assign a
/// process-wide id the first time a given builder runs and reuse it on
/// every later call.
pub struct QueryClient<F, K: KvDelegate> {
    entity_store: EntityStore,
    query_store: Rc<SyncQueryStore<K>>,
    network: NetworkManager,
    formatters: Rc<FormatterRegistry>,
    fetcher: Rc<F>,
    instances: RefCell<HashMap<QueryId, (Rc<QueryDef>, QueryInstance)>>,
    mutations: RefCell<HashMap<u64, MutationTask>>,
    debounce: DebounceScheduler<DebounceSlot>,
    refetch_scheduler: Rc<RefetchIntervalScheduler>,
    eviction: Rc<RefCell<EvictionManager>>,
    eviction_grace_ms: u64,
}

impl<F, K> QueryClient<F, K>
where
    F: QueryFetcher + MutationFetcher + 'static,
    K: KvDelegate + 'static,
{
    pub fn new(fetcher: F, delegate: K) -> Self {
        Self {
            entity_store: EntityStore::new(),
            query_store: Rc::new(SyncQueryStore::new(delegate)),
            network: NetworkManager::new(),
            formatters: Rc::new(FormatterRegistry::new()),
            fetcher: Rc::new(fetcher),
            instances: RefCell::new(HashMap::new()),
            mutations: RefCell::new(HashMap::new()),
            debounce: DebounceScheduler::new(),
            refetch_scheduler: Rc::new(RefetchIntervalScheduler::new(1.0)),
            eviction: Rc::new(RefCell::new(EvictionManager::default())),
            eviction_grace_ms: DEFAULT_EVICTION_INTERVAL_MS,
        }
    }

    pub fn entity_store(&self) -> &EntityStore {
        &self.entity_store
    }

    pub fn network(&self) -> &NetworkManager {
        &self.network
    }

    /// Resolves the request path for `def` given `params`, appending unused
    /// params as a `?a=b&c=d` search-string in declared order (§6 "Path
    /// interpolation").
    fn build_path(def: &QueryDef, params: &QueryParams) -> Result<String, ConfigurationError> {
        let (resolved, unused_names) = interpolate_path(def.path_template, &params.path)
            .map_err(|e| ConfigurationError::new(e.to_string()))?;
        if unused_names.is_empty() {
            return Ok(resolved);
        }
        let query_string: Vec<String> = unused_names
            .into_iter()
            .filter_map(|name| params.search.get(&name).map(|value| format!("{name}={value}")))
            .collect();
        if query_string.is_empty() {
            Ok(resolved)
        } else {
            Ok(format!("{resolved}?{}", query_string.join("&")))
        }
    }

    /// Gets-or-creates the shared instance for `(def, params)`, rehydrating
    /// from the persistent store on first in-process observation, and
    /// fetches per the stale-while-revalidate rules of §4.5.
    pub async fn fetch_query(&self, def: Rc<QueryDef>, params: QueryParams) -> Result<QueryInstance, ConfigurationError> {
        let key = query_key(&def, &params).map_err(|e| ConfigurationError::new(e.to_string()))?;
        self.eviction.borrow_mut().cancel(key);

        let is_new = !self.instances.borrow().contains_key(&key);
        let instance = {
            let mut instances = self.instances.borrow_mut();
            instances
                .entry(key)
                .or_insert_with(|| (def.clone(), QueryInstance::new(key, def.is_infinite())))
                .1
                .clone()
        };

        if is_new {
            if let Some((value, updated_at, ref_ids)) =
                self.query_store.load_query(key, &self.entity_store, now_ms(), def.cache.gc_time_ms).map_err(|e| ConfigurationError::new(e.to_string()))?
            {
                if let Ok(parsed) = serde_json::from_str(&value) {
                    instance.hydrate(parsed, updated_at, ref_ids);
                }
            }
            self.query_store
                .activate_query(def.id, key, def.cache.max_count)
                .map_err(|e| ConfigurationError::new(e.to_string()))?;

            if let Some(interval) = def.cache.refetch_interval_ms {
                self.refetch_scheduler.register(key, interval);
                self.spawn_refetch_driver();
            }
        }

        let path = Self::build_path(&def, &params)?;
        let now = now_ms();
        let has_value = instance.value().is_some();

        if !has_value {
            instance.run_fetch(&def, &path, &*self.fetcher, &self.entity_store, &self.formatters, &self.network, false).await;
            self.persist_instance(&def, key, &instance);
        } else if instance.is_stale(now, def.cache.stale_time_ms) {
            instance.run_fetch(&def, &path, &*self.fetcher, &self.entity_store, &self.formatters, &self.network, true).await;
            self.persist_instance(&def, key, &instance);
        }

        instance.activate_stream(&def, &*self.fetcher, &self.entity_store, &self.formatters);

        Ok(instance)
    }

    fn persist_instance(&self, def: &QueryDef, key: QueryId, instance: &QueryInstance) {
        if let (Some(value), Some(updated_at)) = (instance.value(), instance.updated_at()) {
            let blob = value.to_string();
            let _ = self.query_store.save_query(key, &blob, updated_at, Some(&instance.ref_ids()));
            let _ = self.query_store.activate_query(def.id, key, def.cache.max_count);
            // ref counting above only tracks which entities a query points
            // at; the entities' own field data still needs writing so a
            // later `load_query` has something to preload.
            for entity_key in instance.ref_ids() {
                if let Some(record) = self.entity_store.get(entity_key) {
                    let child_refs = record.ref_ids();
                    let _ = self.query_store.save_entity(entity_key, &record.raw_value().to_string(), Some(&child_refs));
                }
            }
        }
    }

    /// An explicit `refetch()` — bypasses debounce (§4.5). `slot`, if the
    /// caller tracks one for this binding, cancels any debounced fire still
    /// pending for it so the bypassed fetch isn't followed by a redundant
    /// one.
    pub async fn refetch(&self, def: Rc<QueryDef>, params: QueryParams) -> Result<QueryInstance, ConfigurationError> {
        self.refetch_with_slot(def, params, None).await
    }

    pub async fn refetch_with_slot(&self, def: Rc<QueryDef>, params: QueryParams, slot: Option<DebounceSlot>) -> Result<QueryInstance, ConfigurationError> {
        let key = query_key(&def, &params).map_err(|e| ConfigurationError::new(e.to_string()))?;
        if let Some(slot) = slot {
            self.debounce.bypass(slot);
        }
        let instance = {
            let mut instances = self.instances.borrow_mut();
            instances.entry(key).or_insert_with(|| (def.clone(), QueryInstance::new(key, def.is_infinite()))).1.clone()
        };
        let path = Self::build_path(&def, &params)?;
        instance.run_fetch(&def, &path, &*self.fetcher, &self.entity_store, &self.formatters, &self.network, instance.value().is_some()).await;
        self.persist_instance(&def, key, &instance);
        instance.clear_optimistic_inserts();
        let _ = self.query_store.clear_optimistic_insert_refs(key);
        Ok(instance)
    }

    /// `fetchNextPage()` (§4.5): evaluates `getNextPageParams` against the
    /// last parsed page and fetches it, accumulating onto the existing
    /// pages. A no-op (returns the instance unchanged) once `has_next_page`
    /// is false.
    pub async fn fetch_next_page(&self, def: Rc<QueryDef>, base_params: QueryParams, key: QueryId) -> Result<QueryInstance, ConfigurationError> {
        let instance = self.instances.borrow().get(&key).map(|(_, i)| i.clone()).ok_or_else(|| ConfigurationError::new("no such query instance"))?;
        let Some(next_params) = instance.next_page_params() else {
            return Ok(instance);
        };
        let mut merged = base_params;
        merged.path.extend(next_params);
        let path = Self::build_path(&def, &merged)?;
        instance.run_fetch_next_page(&def, &path, &*self.fetcher, &self.entity_store, &self.formatters, &self.network).await;
        self.persist_instance(&def, key, &instance);
        Ok(instance)
    }

    /// A debounced parameter-change-triggered refetch (§4.5 "Debounce").
    /// The initial fetch must go through [`Self::fetch_query`] instead —
    /// this is only for subsequent parameter changes.
    ///
    /// `slot` identifies the reactive binding issuing the change, not the
    /// resolved query — it stays the same across a `123 -> 456 -> 789`
    /// parameter flip even though each value hashes to a different
    /// `QueryId`, so the debounce window collapses across the whole flip
    /// instead of giving each resolved value its own independent timer
    /// (§8 scenario 5).
    pub fn schedule_debounced_refetch(self: &Rc<Self>, slot: DebounceSlot, def: Rc<QueryDef>, params: QueryParams)
    where
        F: 'static,
        K: 'static,
    {
        let Some(delay) = def.cache.debounce_ms else {
            return;
        };
        let client = self.clone();
        self.debounce.schedule(slot, delay, async move {
            let _ = client.refetch_with_slot(def, params, Some(slot)).await;
        });
    }

    // -- watcher lifecycle / memory eviction (§4.7) ----------------------

    pub fn watch(&self, key: QueryId) {
        if let Some((_, instance)) = self.instances.borrow().get(&key) {
            instance.watch();
        }
        self.eviction.borrow_mut().cancel(key);
    }

    /// Last watcher dropped — cancels refetch-interval scheduling, and
    /// schedules the instance for eviction after surviving one full tick
    /// (§5 "Cancellation").
    pub fn unwatch(&self, key: QueryId) {
        let should_deactivate = self.instances.borrow().get(&key).map(|(_, i)| i.unwatch()).unwrap_or(false);
        if should_deactivate {
            self.refetch_scheduler.unregister(key);
            self.eviction.borrow_mut().schedule(key);
        }
    }

    /// Runs one eviction tick: removes every in-memory instance in the
    /// current bucket (persistent state survives) and rotates the next
    /// bucket into place.
    pub fn run_eviction_tick(&self) {
        let evicted = self.eviction.borrow_mut().tick();
        let mut instances = self.instances.borrow_mut();
        for key in evicted {
            if let Some((_, instance)) = instances.get(&key) {
                if instance.watcher_count() == 0 {
                    instance.deactivate_stream();
                    instances.remove(&key);
                }
            }
        }
    }

    fn spawn_refetch_driver(&self) {
        let instances = self.snapshot_instances_handle();
        let fetcher = self.fetcher.clone();
        let entity_store = self.entity_store.clone();
        let formatters = self.formatters.clone();
        let network = self.network.clone();
        self.refetch_scheduler.clone().ensure_running(move |key| {
            if let Some((def, instance)) = instances.borrow().get(&key).cloned() {
                if instance.is_fetching() {
                    return; // a scheduled tick is skipped if the prior fetch is still in flight (§4.5)
                }
                let fetcher = fetcher.clone();
                let entity_store = entity_store.clone();
                let formatters = formatters.clone();
                let network = network.clone();
                tokio::task::spawn_local(async move {
                    // the refetch-interval driver only knows the key, not the
                    // concrete params; instances registered for interval
                    // refetch are expected to have a path-free definition or
                    // the caller re-derives params from `key` externally.
                    let path = def.path_template;
                    instance.run_fetch(&def, path, &*fetcher, &entity_store, &formatters, &network, true).await;
                });
            }
        });
    }

    /// Starts the two-generation eviction manager's fixed-interval tick
    /// loop (§4.7, default 60s). Idempotent to call more than once is the
    /// caller's responsibility — typically invoked once right after
    /// construction.
    pub fn spawn_eviction_loop(self: &Rc<Self>)
    where
        F: 'static,
        K: 'static,
    {
        let client = self.clone();
        let interval_ms = self.eviction_grace_ms.max(1);
        tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                client.run_eviction_tick();
            }
        });
    }

    fn snapshot_instances_handle(&self) -> Rc<RefCell<HashMap<QueryId, (Rc<QueryDef>, QueryInstance)>>> {
        // `instances` already lives behind an Rc-free RefCell owned by
        // `self`; the scheduler callback needs its own Rc handle since it
        // outlives any single call into the client, so this clones the map
        // once at registration time rather than sharing `self`'s RefCell
        // directly (the client itself is not guaranteed to outlive the
        // spawned task).
        Rc::new(RefCell::new(self.instances.borrow().clone()))
    }

    // -- invalidation / introspection (supplemented, see SPEC_FULL.md) --

    /// Marks `key`'s instance stale by clearing `updated_at` — the next
    /// `fetch_query` call sees `is_stale() == true` and revalidates in the
    /// background, serving the cached value in the meantime.
    pub fn invalidate(&self, key: QueryId) {
        if let Some((_, instance)) = self.instances.borrow().get(&key) {
            instance.mark_stale();
        }
    }

    pub fn invalidate_all(&self) {
        for (_, instance) in self.instances.borrow().values() {
            instance.mark_stale();
        }
    }

    pub fn has_cached_data(&self, key: QueryId) -> bool {
        self.instances.borrow().get(&key).map(|(_, i)| i.value().is_some()).unwrap_or(false)
    }

    pub fn clear_cache(&self) {
        self.instances.borrow_mut().clear();
        self.mutations.borrow_mut().clear();
    }

    /// Overlays `entity` on the live instance for `key` (§4.5 "Optimistic
    /// inserts"). Rejected if `key` has no live instance, or if its
    /// definition never declared `optimisticInserts`.
    pub fn add_optimistic_insert(&self, key: QueryId, entity: EntityId) -> Result<(), ConfigurationError> {
        let instances = self.instances.borrow();
        let (def, instance) = instances.get(&key).ok_or_else(|| ConfigurationError::new("no live query instance for this key"))?;
        instance.add_optimistic_insert(def, entity)
    }

    // -- mutations (§4.6) -------------------------------------------------

    /// Resolves (or creates) the task for a mutation definition. Each call
    /// to `mutate` reuses the same long-lived task identified by
    /// `def.id` until `reset_mutation` is called.
    pub fn mutation_task(&self, def: &MutationDef) -> MutationTask {
        self.mutations.borrow_mut().entry(def.id).or_insert_with(MutationTask::new).clone()
    }

    pub fn reset_mutation(&self, def: &MutationDef) {
        if let Some(task) = self.mutations.borrow().get(&def.id) {
            task.reset(&self.entity_store);
        }
        self.mutations.borrow_mut().remove(&def.id);
    }

    pub async fn mutate(&self, def: &MutationDef, path_params: &std::collections::BTreeMap<String, PathParam>, request: serde_json::Value) -> MutationTask {
        let task = self.mutation_task(def);
        let path = interpolate_path(def.path_template, path_params).map(|(p, _)| p).unwrap_or_else(|_| def.path_template.to_string());
        task.run(def, &path, &request, &*self.fetcher, &self.entity_store, &self.formatters).await;
        task
    }
}

/// Raised at the call site (synchronously, before any task is created) when
/// a query/mutation is resolved outside of a client scope — exposed for
/// framework bindings that need to fail fast rather than panic.
pub fn require_client<'a, F, K: KvDelegate>(client: Option<&'a QueryClient<F, K>>) -> Result<&'a QueryClient<F, K>, ContextError> {
    client.ok_or(ContextError)
}

fn now_ms() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as f64)
        .unwrap_or(0.0)
}
