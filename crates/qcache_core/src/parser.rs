//! Parser / Proxy layer, parsing half (§4.2).
//!
//! `parse_value` validates a raw JSON value against a `TypeDef`, applies
//! per-field formatters, discovers entities and registers them with the
//! [`crate::entity_store::EntityStore`], and returns the parsed value with
//! entity positions replaced by their `{entityRef: key}` marker — the same
//! shape a live proxy's `toJSON` produces, so a parsed tree and a
//! subsequently-read proxy tree serialize identically.

use crate::entity_store::EntityStore;
use crate::error::ValidationError;
use crate::mask::Mask;
use crate::registry::{ComplexKind, TypeDef};
use qcache_common::EntityId;
use serde_json::Value;
use std::collections::HashMap;

/// A named formatter applied to primitive positions carrying `format(name)`.
pub type FormatterFn = fn(&Value) -> Result<Value, String>;

/// Resolves `format(name)` slots at parse time. Left unregistered, a
/// formatted position is validated against its base mask only and passed
/// through unchanged — formatters are opt-in, not a parsing requirement.
#[derive(Default, Clone)]
pub struct FormatterRegistry {
    formatters: HashMap<&'static str, FormatterFn>,
}

impl FormatterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: &'static str, f: FormatterFn) -> Self {
        self.formatters.insert(name, f);
        self
    }
}

/// Threaded through every recursive `parse_value` call.
pub struct ParseContext<'a> {
    pub entity_store: &'a EntityStore,
    pub formatters: &'a FormatterRegistry,
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => format!("boolean({b})"),
        Value::Number(n) => format!("number({n})"),
        Value::String(s) if s.len() > 40 => format!("string({}...)", &s[..40]),
        Value::String(s) => format!("string({s})"),
        Value::Array(a) => format!("array(len={})", a.len()),
        Value::Object(_) => "object".to_string(),
    }
}

fn field_path(path: &str, field: &str) -> String {
    if path.is_empty() {
        field.to_string()
    } else {
        format!("{path}.{field}")
    }
}

fn index_path(path: &str, index: usize) -> String {
    format!("{path}[{index}]")
}

/// `parseValue(value, def, pathBreadcrumb) → parsed` (§4.2).
pub fn parse_value(
    value: &Value,
    def: &TypeDef,
    path: &str,
    ctx: &ParseContext<'_>,
    refs_out: &mut Vec<EntityId>,
) -> Result<Value, ValidationError> {
    match def {
        TypeDef::Bare(mask) => parse_bare(value, *mask, path),
        TypeDef::Const { mask, value: expected } => {
            parse_bare(value, *mask, path)?;
            if value == expected {
                Ok(value.clone())
            } else {
                Err(ValidationError::new(path, format!("const {expected}"), describe(value)))
            }
        }
        TypeDef::Enum { mask, values } => {
            parse_bare(value, *mask, path)?;
            if values.contains(value) {
                Ok(value.clone())
            } else {
                Err(ValidationError::new(path, "one of enum set", describe(value)))
            }
        }
        TypeDef::Formatted { mask, format } => {
            parse_bare(value, *mask, path)?;
            match ctx.formatters.formatters.get(format) {
                Some(f) => f(value).map_err(|reason| ValidationError::new(path, format!("format `{format}`"), reason)),
                None => Ok(value.clone()),
            }
        }
        TypeDef::Complex(complex) => match &complex.kind {
            ComplexKind::Object { fields } => parse_object(value, fields, path, ctx, refs_out),
            ComplexKind::Entity(shape) => parse_entity(value, shape, complex.shape_key, path, ctx, refs_out),
            ComplexKind::Array { element } => parse_array(value, element, path, ctx, refs_out),
            ComplexKind::Record { value: element } => parse_record(value, element, path, ctx, refs_out),
            ComplexKind::Union(shape) => parse_union(value, shape, path, ctx, refs_out),
        },
    }
}

fn parse_bare(value: &Value, mask: Mask, path: &str) -> Result<(), ValidationError> {
    if Mask::of_json(value).intersects(mask) {
        Ok(())
    } else {
        Err(ValidationError::new(path, format!("mask {:?}", mask.bits()), describe(value)))
    }
}

fn parse_object(
    value: &Value,
    fields: &std::collections::BTreeMap<String, TypeDef>,
    path: &str,
    ctx: &ParseContext<'_>,
    refs_out: &mut Vec<EntityId>,
) -> Result<Value, ValidationError> {
    let Value::Object(map) = value else {
        return Err(ValidationError::new(path, "object", describe(value)));
    };

    let mut out = serde_json::Map::new();
    // extra fields on the input are preserved but unparsed
    for (k, v) in map {
        if !fields.contains_key(k) {
            out.insert(k.clone(), v.clone());
        }
    }
    for (name, field_def) in fields {
        let field_value = map.get(name).cloned().unwrap_or(Value::Null);
        let parsed = parse_value(&field_value, field_def, &field_path(path, name), ctx, refs_out)?;
        out.insert(name.clone(), parsed);
    }
    Ok(Value::Object(out))
}

fn parse_entity(
    value: &Value,
    shape: &crate::registry::EntityShape,
    shape_key: u64,
    path: &str,
    ctx: &ParseContext<'_>,
    refs_out: &mut Vec<EntityId>,
) -> Result<Value, ValidationError> {
    let Value::Object(map) = value else {
        return Err(ValidationError::new(path, "entity object", describe(value)));
    };

    let typename = map
        .get(&shape.typename_field)
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::new(field_path(path, &shape.typename_field), "typename string", "missing"))?;
    if typename != shape.typename_value {
        return Err(ValidationError::new(
            field_path(path, &shape.typename_field),
            format!("typename {}", shape.typename_value),
            typename.to_string(),
        ));
    }

    let id_value = map
        .get(&shape.id_field)
        .ok_or_else(|| ValidationError::new(field_path(path, &shape.id_field), "id", "missing"))?;
    let id_str = match id_value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => return Err(ValidationError::new(field_path(path, &shape.id_field), "id", describe(other))),
    };

    // shape_key isolates caches across schema projections of the same typename
    let key = qcache_common::hash_entity_key(&shape.typename_value, &id_str, shape_key);

    // register immediate children discovered through sub-entity paths only —
    // the entity position itself is not recursively parsed eagerly.
    let mut child_refs = Vec::new();
    for field_name in &shape.sub_entity_paths {
        if let (Some(field_value), Some(field_def)) = (map.get(field_name), shape.fields.get(field_name)) {
            let _ = parse_value(field_value, field_def, &field_path(path, field_name), ctx, &mut child_refs)?;
        }
    }

    // this entity's own child refs are persisted alongside it so a later
    // cascading delete of `key` recurses into them too (§8 scenario 2).
    ctx.entity_store.merge(key, Value::Object(map.clone()), Some(child_refs));
    refs_out.push(key);

    Ok(serde_json::json!({ "entityRef": key.0 }))
}

fn parse_array(
    value: &Value,
    element_def: &TypeDef,
    path: &str,
    ctx: &ParseContext<'_>,
    refs_out: &mut Vec<EntityId>,
) -> Result<Value, ValidationError> {
    let Value::Array(items) = value else {
        return Err(ValidationError::new(path, "array", describe(value)));
    };

    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        match parse_value(item, element_def, &index_path(path, i), ctx, refs_out) {
            Ok(parsed) => out.push(parsed),
            Err(e) => {
                // element-level failures are filtered, not fatal (§4.2)
                tracing::warn!(path = %e.path, expected = %e.expected, got = %e.got, "dropping array element that failed validation");
            }
        }
    }
    Ok(Value::Array(out))
}

fn parse_record(
    value: &Value,
    element_def: &TypeDef,
    path: &str,
    ctx: &ParseContext<'_>,
    refs_out: &mut Vec<EntityId>,
) -> Result<Value, ValidationError> {
    let Value::Object(map) = value else {
        return Err(ValidationError::new(path, "record", describe(value)));
    };

    let mut out = serde_json::Map::new();
    for (k, v) in map {
        let parsed = parse_value(v, element_def, &field_path(path, k), ctx, refs_out)?;
        out.insert(k.clone(), parsed);
    }
    Ok(Value::Object(out))
}

fn parse_union(
    value: &Value,
    shape: &crate::registry::UnionShape,
    path: &str,
    ctx: &ParseContext<'_>,
    refs_out: &mut Vec<EntityId>,
) -> Result<Value, ValidationError> {
    match value {
        Value::Array(_) => {
            if let Some(def) = &shape.array_branch {
                return parse_value(value, def, path, ctx, refs_out);
            }
        }
        Value::Object(map) => {
            if let Some(typename) = map.get("typename").and_then(Value::as_str) {
                let key = format!("typename:{typename}");
                if let Some(def) = shape.by_typename.get(&key) {
                    return parse_value(value, def, path, ctx, refs_out);
                }
            }
            // fall back to a record-shaped variant if no typename discriminator matched
            if let Some(def) = &shape.record_branch {
                return parse_value(value, def, path, ctx, refs_out);
            }
        }
        _ => {
            if let Some(def) = &shape.literal_branch {
                return parse_value(value, def, path, ctx, refs_out);
            }
        }
    }
    Err(ValidationError::new(path, "matching union variant", describe(value)))
}

/// `parseEntities(value, def, entityStore, refsOut)` (§4.2): traverses
/// `value`, mints/updates entity records for every discovered entity
/// position, and collects the set of root-level entity keys reached from
/// `value` into the returned vector.
pub fn parse_entities(
    value: &Value,
    def: &TypeDef,
    entity_store: &EntityStore,
    formatters: &FormatterRegistry,
) -> Result<(Value, Vec<EntityId>), ValidationError> {
    let ctx = ParseContext { entity_store, formatters };
    let mut refs_out = Vec::new();
    let parsed = parse_value(value, def, "", &ctx, &mut refs_out)?;
    Ok((parsed, refs_out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::builders;

    fn user_def() -> TypeDef {
        builders::entity(
            "User",
            [("typename", builders::typename("User")), ("id", builders::id()), ("name", builders::string())],
            None,
        )
    }

    #[test]
    fn parses_plain_object() {
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();
        let def = builders::object([("count", builders::number())]);
        let (parsed, refs) = parse_entities(&serde_json::json!({"count": 3}), &def, &store, &formatters).unwrap();
        assert_eq!(parsed, serde_json::json!({"count": 3.0}));
        assert!(refs.is_empty());
    }

    #[test]
    fn parses_entity_and_registers_it() {
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();
        let def = user_def();
        let raw = serde_json::json!({"typename": "User", "id": "1", "name": "Alice"});
        let (parsed, refs) = parse_entities(&raw, &def, &store, &formatters).unwrap();
        assert_eq!(refs.len(), 1);
        assert!(parsed.get("entityRef").is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn array_filters_bad_elements_but_keeps_good_ones() {
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();
        let def = builders::array(user_def());
        let raw = serde_json::json!([
            {"typename": "User", "id": "1", "name": "Alice"},
            {"typename": "Wrong", "id": "2", "name": "Bob"},
        ]);
        let (parsed, refs) = parse_entities(&raw, &def, &store, &formatters).unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(parsed.as_array().unwrap().len(), 1);
    }

    #[test]
    fn rejects_wrong_primitive_kind() {
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();
        let def = builders::object([("count", builders::number())]);
        let err = parse_entities(&serde_json::json!({"count": "nope"}), &def, &store, &formatters).unwrap_err();
        assert_eq!(err.path, "count");
    }

    #[test]
    fn union_dispatches_by_typename() {
        let store = EntityStore::new();
        let formatters = FormatterRegistry::new();
        let def = builders::union([user_def()]);
        let raw = serde_json::json!({"typename": "User", "id": "1", "name": "Alice"});
        let (_, refs) = parse_entities(&raw, &def, &store, &formatters).unwrap();
        assert_eq!(refs.len(), 1);
    }

}
