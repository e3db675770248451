//! Builder functions returning `TypeDef`s (§4.1).

use super::{sub_entity_paths_of, ComplexDef, ComplexKind, EntityShape, StreamDescriptor, TypeDef, UnionShape};
use crate::mask::Mask;
use std::collections::BTreeMap;
use std::sync::Arc;

pub fn string() -> TypeDef {
    TypeDef::Bare(Mask::STRING)
}

pub fn number() -> TypeDef {
    TypeDef::Bare(Mask::NUMBER)
}

pub fn boolean() -> TypeDef {
    TypeDef::Bare(Mask::BOOLEAN)
}

/// An opaque identifier position — distinct from a plain `string` so the
/// entity builder can tell id fields apart from display fields that happen
/// to also be strings.
pub fn id() -> TypeDef {
    TypeDef::Bare(Mask::ID | Mask::STRING)
}

pub fn null() -> TypeDef {
    TypeDef::Bare(Mask::NULL)
}

pub fn undefined() -> TypeDef {
    TypeDef::Bare(Mask::UNDEFINED)
}

/// A single literal constant. `typename(X)` is expressed in terms of this
/// builder — it is both the expected constant value and a literal type.
pub fn const_value(value: serde_json::Value) -> TypeDef {
    let mask = Mask::of_json(&value);
    TypeDef::Const { mask, value }
}

/// `typename(X)`: a singleton constant used as an entity's discriminator.
pub fn typename(value: impl Into<String>) -> TypeDef {
    const_value(serde_json::Value::String(value.into()))
}

/// A closed set of literal constants.
pub fn enum_values(values: impl IntoIterator<Item = serde_json::Value>) -> TypeDef {
    let values: Vec<serde_json::Value> = values.into_iter().collect();
    let mask = values.iter().fold(Mask::NONE, |acc, v| acc | Mask::of_json(v));
    TypeDef::Enum { mask, values }
}

fn object_shape_key(fields: &BTreeMap<String, TypeDef>) -> u64 {
    let mut rendered: Vec<String> = fields
        .iter()
        .map(|(name, def)| format!("{name}:{}", def.shape_key()))
        .collect();
    rendered.sort();
    qcache_common::hash_shape(&format!("object[{}]", rendered.join(",")))
}

pub fn array(element: TypeDef) -> TypeDef {
    let shape_key = qcache_common::hash_shape(&format!("array[{}]", element.shape_key()));
    TypeDef::Complex(Arc::new(ComplexDef {
        mask: Mask::ARRAY,
        shape_key,
        kind: ComplexKind::Array { element: Arc::new(element) },
    }))
}

pub fn record(value: TypeDef) -> TypeDef {
    let shape_key = qcache_common::hash_shape(&format!("record[{}]", value.shape_key()));
    TypeDef::Complex(Arc::new(ComplexDef {
        mask: Mask::RECORD,
        shape_key,
        kind: ComplexKind::Record { value: Arc::new(value) },
    }))
}

pub fn object<I>(fields: I) -> TypeDef
where
    I: IntoIterator<Item = (&'static str, TypeDef)>,
{
    let fields: BTreeMap<String, TypeDef> = fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    let shape_key = object_shape_key(&fields);
    let has_sub_entity = fields.values().any(|d| d.mask().intersects(Mask::ENTITY | Mask::HAS_SUB_ENTITY));
    let mut mask = Mask::OBJECT;
    if has_sub_entity {
        mask |= Mask::HAS_SUB_ENTITY;
    }
    TypeDef::Complex(Arc::new(ComplexDef {
        mask,
        shape_key,
        kind: ComplexKind::Object { fields },
    }))
}

/// An entity position. `typename_value` discriminates the shape;
/// `typename_field`/`id_field` name the fields that carry them within
/// `fields` (conventionally `"typename"`/`"id"` — use
/// [`entity_named`] to override).
pub fn entity<I>(typename_value: impl Into<String>, fields: I, stream: Option<StreamDescriptor>) -> TypeDef
where
    I: IntoIterator<Item = (&'static str, TypeDef)>,
{
    entity_named(typename_value, "typename", "id", fields, stream)
}

pub fn entity_named<I>(
    typename_value: impl Into<String>,
    typename_field: &str,
    id_field: &str,
    fields: I,
    stream: Option<StreamDescriptor>,
) -> TypeDef
where
    I: IntoIterator<Item = (&'static str, TypeDef)>,
{
    let fields: BTreeMap<String, TypeDef> = fields.into_iter().map(|(k, v)| (k.to_string(), v)).collect();
    let shape_key = object_shape_key(&fields);
    let sub_entity_paths = sub_entity_paths_of(&fields);
    TypeDef::Complex(Arc::new(ComplexDef {
        mask: Mask::OBJECT | Mask::ENTITY,
        shape_key,
        kind: ComplexKind::Entity(EntityShape {
            fields,
            typename_value: typename_value.into(),
            typename_field: typename_field.to_string(),
            id_field: id_field.to_string(),
            sub_entity_paths,
            stream,
        }),
    }))
}

/// Extends an entity definition with additional/overridden fields. The
/// resulting shape strictly extends the parent's — it is an error to
/// redeclare a field name the parent already carries.
pub fn extend_entity<I>(parent: &TypeDef, additional_fields: I) -> Result<TypeDef, String>
where
    I: IntoIterator<Item = (&'static str, TypeDef)>,
{
    let parent_shape = parent
        .as_entity()
        .ok_or_else(|| "extend() called on a non-entity definition".to_string())?;

    let mut fields = parent_shape.fields.clone();
    for (name, def) in additional_fields {
        if fields.contains_key(name) {
            return Err(format!("extend() collides on existing field `{name}`"));
        }
        fields.insert(name.to_string(), def);
    }

    let shape_key = object_shape_key(&fields);
    let sub_entity_paths = sub_entity_paths_of(&fields);
    Ok(TypeDef::Complex(Arc::new(ComplexDef {
        mask: Mask::OBJECT | Mask::ENTITY,
        shape_key,
        kind: ComplexKind::Entity(EntityShape {
            fields,
            typename_value: parent_shape.typename_value.clone(),
            typename_field: parent_shape.typename_field.clone(),
            id_field: parent_shape.id_field.clone(),
            sub_entity_paths,
            stream: parent_shape.stream.clone(),
        }),
    })))
}

/// A discriminated union. Entity/object variants dispatch by their
/// `typename_field`'s value; a variant built from `array`/`record` becomes
/// the reserved array/record branch; a variant built from `enum_values`
/// becomes the literal-set branch.
pub fn union<I>(variants: I) -> TypeDef
where
    I: IntoIterator<Item = TypeDef>,
{
    let mut shape = UnionShape::default();
    let mut mask = Mask::UNION;
    let mut rendered_keys = Vec::new();

    for variant in variants {
        mask |= variant.mask();
        match &variant {
            TypeDef::Complex(c) => match &c.kind {
                ComplexKind::Entity(e) => {
                    let key = format!("typename:{}", e.typename_value);
                    rendered_keys.push(key.clone());
                    shape.by_typename.insert(key, variant);
                }
                ComplexKind::Object { .. } => {
                    let key = format!("object:{}", variant.shape_key());
                    rendered_keys.push(key.clone());
                    shape.by_typename.insert(key, variant);
                }
                ComplexKind::Array { .. } => {
                    rendered_keys.push("array".to_string());
                    shape.array_branch = Some(Arc::new(variant));
                }
                ComplexKind::Record { .. } => {
                    rendered_keys.push("record".to_string());
                    shape.record_branch = Some(Arc::new(variant));
                }
                ComplexKind::Union(_) => {
                    rendered_keys.push(format!("nested-union:{}", variant.shape_key()));
                }
            },
            TypeDef::Enum { .. } => {
                rendered_keys.push(format!("literal:{}", variant.shape_key()));
                shape.literal_branch = Some(Arc::new(variant));
            }
            other => {
                rendered_keys.push(format!("scalar:{}", other.shape_key()));
            }
        }
    }

    rendered_keys.sort();
    let shape_key = qcache_common::hash_shape(&format!("union[{}]", rendered_keys.join(",")));

    TypeDef::Complex(Arc::new(ComplexDef {
        mask,
        shape_key,
        kind: ComplexKind::Union(shape),
    }))
}

/// `format(name)`: a user-parser-resolved typed slot over a primitive base
/// (e.g. `date`, `date-time`, `integer`).
pub fn format(name: &'static str, base: TypeDef) -> TypeDef {
    let base_mask = base.mask();
    let flag = if base_mask.intersects(Mask::NUMBER) {
        Mask::HAS_NUMBER_FORMAT
    } else {
        Mask::HAS_STRING_FORMAT
    };
    TypeDef::Formatted { mask: base_mask | flag, format: name }
}
