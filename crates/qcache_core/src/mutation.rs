//! Mutation Engine (§4.6): a mutation owns a single long-lived task that
//! optimistically patches entities before its request settles, and reverts
//! them on failure.

use crate::entity_store::EntityStore;
use crate::error::{MutationError, TransportError};
use crate::parser::{parse_entities, FormatterRegistry};
use crate::query::{HttpMethod, RetryPolicy};
use crate::registry::{ComplexKind, TypeDef};
use qcache_common::EntityId;
use reactive_graph::prelude::*;
use reactive_graph::signal::RwSignal;
use serde_json::Value;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Pending,
    Resolved,
    Rejected,
}

/// A mutation's static shape: method/path, whether it applies optimistic
/// patches before the request settles, and the request/response schemas
/// used to walk for entity positions and to parse the result (§4.6).
pub struct MutationDef {
    pub id: u64,
    pub path_template: &'static str,
    pub method: HttpMethod,
    pub optimistic_updates: bool,
    pub request_def: Option<TypeDef>,
    pub response_def: TypeDef,
    pub retry: RetryPolicy,
}

impl Default for MutationDef {
    fn default() -> Self {
        Self {
            id: 0,
            path_template: "",
            method: HttpMethod::Post,
            optimistic_updates: false,
            request_def: None,
            response_def: TypeDef::Bare(crate::mask::Mask::NONE),
            retry: RetryPolicy::none(),
        }
    }
}

pub trait MutationFetcher {
    fn mutate(
        &self,
        method: &'static str,
        path: &str,
        body: &Value,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, TransportError>>>>;
}

struct TaskState {
    status: RwSignal<MutationStatus>,
    value: RwSignal<Option<Value>>,
    error: RwSignal<Option<MutationError>>,
    pending_keys: RwSignal<Vec<EntityId>>,
}

/// The in-memory task for one mutation (§ GLOSSARY, §4.6). `reset()`
/// discards this instance's state and callers construct a fresh
/// `MutationTask` to run again — matching the source's "creates a fresh
/// task instance" contract.
#[derive(Clone)]
pub struct MutationTask {
    state: Rc<TaskState>,
}

impl Default for MutationTask {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationTask {
    pub fn new() -> Self {
        Self {
            state: Rc::new(TaskState {
                status: RwSignal::new(MutationStatus::Idle),
                value: RwSignal::new(None),
                error: RwSignal::new(None),
                pending_keys: RwSignal::new(Vec::new()),
            }),
        }
    }

    pub fn status(&self) -> MutationStatus {
        self.state.status.get()
    }

    pub fn value(&self) -> Option<Value> {
        self.state.value.get()
    }

    pub fn error(&self) -> Option<MutationError> {
        self.state.error.get()
    }

    pub fn is_pending(&self) -> bool {
        self.status() == MutationStatus::Pending
    }

    pub fn is_resolved(&self) -> bool {
        self.status() == MutationStatus::Resolved
    }

    pub fn is_rejected(&self) -> bool {
        self.status() == MutationStatus::Rejected
    }

    pub fn is_settled(&self) -> bool {
        matches!(self.status(), MutationStatus::Resolved | MutationStatus::Rejected)
    }

    pub fn is_ready(&self) -> bool {
        self.value().is_some()
    }

    /// Reverts any pending optimistic updates still held by this task and
    /// resets it to `Idle`, matching the source's `reset()` contract of
    /// handing back a task object usable for another `run()`.
    pub fn reset(&self, entity_store: &EntityStore) {
        for key in self.state.pending_keys.get_untracked() {
            entity_store.revert_optimistic(key);
        }
        self.state.pending_keys.set(Vec::new());
        self.state.status.set(MutationStatus::Idle);
        self.state.value.set(None);
        self.state.error.set(None);
    }

    /// `run(request)` (§4.6): optionally applies optimistic patches, runs
    /// `mutate_fn` with retry, then either commits (clears pending,
    /// resolves) or reverts (restores every pending key's snapshot,
    /// surfaces the error).
    pub async fn run<F: MutationFetcher>(
        &self,
        def: &MutationDef,
        path: &str,
        request: &Value,
        fetcher: &F,
        entity_store: &EntityStore,
        formatters: &FormatterRegistry,
    ) {
        self.state.status.set(MutationStatus::Pending);
        self.state.error.set(None);

        let mut pending = Vec::new();
        if def.optimistic_updates {
            if let Some(request_def) = &def.request_def {
                for (key, patch) in collect_request_entities(request, request_def) {
                    entity_store.set_optimistic_snapshot(key);
                    entity_store.merge(key, patch, None);
                    pending.push(key);
                }
            }
        }
        self.state.pending_keys.set(pending.clone());

        let mut attempt = 0u32;
        let outcome = loop {
            match fetcher.mutate(def.method.as_str(), path, request).await {
                Ok(raw) => break parse_entities(&raw, &def.response_def, entity_store, formatters).map_err(MutationError::Validation),
                Err(err) => {
                    if attempt >= def.retry.retries {
                        break Err(MutationError::Transport(err));
                    }
                    let delay = def.retry.delay_ms(attempt);
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                }
            }
        };

        match outcome {
            Ok((parsed, _refs)) => {
                for key in &pending {
                    entity_store.clear_optimistic(*key);
                }
                self.state.pending_keys.set(Vec::new());
                self.state.value.set(Some(parsed));
                self.state.status.set(MutationStatus::Resolved);
            }
            Err(err) => {
                for key in &pending {
                    entity_store.revert_optimistic(*key);
                }
                self.state.pending_keys.set(Vec::new());
                self.state.error.set(Some(err));
                self.state.status.set(MutationStatus::Rejected);
            }
        }
    }
}

/// Walks `value` against `def` collecting every entity position's key and
/// the raw fields to merge (the caller's own patch, not a full re-parse —
/// optimistic patches merge whatever the request declared, they don't
/// invent values for fields the request didn't set).
fn collect_request_entities(value: &Value, def: &TypeDef) -> Vec<(EntityId, Value)> {
    let mut out = Vec::new();
    walk(value, def, &mut out);
    out
}

fn walk(value: &Value, def: &TypeDef, out: &mut Vec<(EntityId, Value)>) {
    let TypeDef::Complex(complex) = def else {
        return;
    };
    match &complex.kind {
        ComplexKind::Entity(shape) => {
            let Value::Object(map) = value else { return };
            let Some(typename) = map.get(&shape.typename_field).and_then(Value::as_str) else {
                return;
            };
            let Some(id_value) = map.get(&shape.id_field) else { return };
            let id_str = match id_value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return,
            };
            let key = qcache_common::hash_entity_key(typename, &id_str, complex.shape_key);
            out.push((key, value.clone()));
            for (name, field_def) in &shape.fields {
                if let Some(field_value) = map.get(name) {
                    walk(field_value, field_def, out);
                }
            }
        }
        ComplexKind::Object { fields } => {
            let Value::Object(map) = value else { return };
            for (name, field_def) in fields {
                if let Some(field_value) = map.get(name) {
                    walk(field_value, field_def, out);
                }
            }
        }
        ComplexKind::Array { element } => {
            let Value::Array(items) = value else { return };
            for item in items {
                walk(item, element, out);
            }
        }
        ComplexKind::Record { value: element } => {
            let Value::Object(map) = value else { return };
            for v in map.values() {
                walk(v, element, out);
            }
        }
        ComplexKind::Union(shape) => {
            if let Value::Object(map) = value {
                if let Some(typename) = map.get("typename").and_then(Value::as_str) {
                    if let Some(variant_def) = shape.by_typename.get(&format!("typename:{typename}")) {
                        walk(value, variant_def, out);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::builders;

    fn user_def() -> TypeDef {
        builders::entity("User", [("typename", builders::typename("User")), ("id", builders::id()), ("name", builders::string())], None)
    }

    struct RejectingFetcher;
    impl MutationFetcher for RejectingFetcher {
        fn mutate(&self, _: &'static str, _: &str, _: &Value) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, TransportError>>>> {
            Box::pin(async { Err(TransportError::Failed { url: "".into(), reason: "rejected".into() }) })
        }
    }

    struct AcceptingFetcher(Value);
    impl MutationFetcher for AcceptingFetcher {
        fn mutate(&self, _: &'static str, _: &str, _: &Value) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, TransportError>>>> {
            let v = self.0.clone();
            Box::pin(async move { Ok(v) })
        }
    }

    #[tokio::test]
    async fn failed_mutation_reverts_optimistic_patch() {
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();
        let key = qcache_common::hash_entity_key("User", "1", user_def().shape_key());
        store.preload(key, serde_json::json!({"typename": "User", "id": "1", "name": "Alice"}), Vec::new());

        let def = MutationDef {
            optimistic_updates: true,
            request_def: Some(user_def()),
            response_def: user_def(),
            ..MutationDef::default()
        };
        let task = MutationTask::new();
        let request = serde_json::json!({"typename": "User", "id": "1", "name": "Bob"});
        task.run(&def, "/users/1", &request, &RejectingFetcher, &store, &formatters).await;

        assert!(task.is_rejected());
        let record = store.get(key).unwrap();
        assert_eq!(record.raw_value()["name"], "Alice");
    }

    #[tokio::test]
    async fn successful_mutation_commits_and_clears_pending() {
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();
        let key = qcache_common::hash_entity_key("User", "1", user_def().shape_key());
        store.preload(key, serde_json::json!({"typename": "User", "id": "1", "name": "Alice"}), Vec::new());

        let def = MutationDef {
            optimistic_updates: true,
            request_def: Some(user_def()),
            response_def: user_def(),
            ..MutationDef::default()
        };
        let task = MutationTask::new();
        let request = serde_json::json!({"typename": "User", "id": "1", "name": "Bob"});
        let response = serde_json::json!({"typename": "User", "id": "1", "name": "Bob"});
        task.run(&def, "/users/1", &request, &AcceptingFetcher(response), &store, &formatters).await;

        assert!(task.is_resolved());
        let record = store.get(key).unwrap();
        assert_eq!(record.raw_value()["name"], "Bob");
    }
}
