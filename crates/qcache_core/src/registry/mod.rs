//! Type Registry (§4.1): a declarative schema of value shapes.
//!
//! `TypeDef` values are produced by the builder functions in this module and
//! composed into object/entity/array/record/union shapes. Every complex
//! shape carries a stable `shape_key`, hashed from a canonical textual
//! representation of its resolved fields — the same role `shapeKey` plays
//! in the source: it distinguishes entity caches across schema projections.

mod builders;
mod stream;

pub use builders::*;
pub use stream::StreamDescriptor;

use crate::mask::Mask;
use std::collections::BTreeMap;
use std::sync::Arc;

/// One resolved schema position.
#[derive(Clone, Debug)]
pub enum TypeDef {
    /// A bare primitive mask (`string`, `number`, optional/nullable
    /// combinations thereof).
    Bare(Mask),
    /// A single literal constant (`typename(X)`, `const(literal)`).
    Const {
        mask: Mask,
        value: serde_json::Value,
    },
    /// A closed set of literal constants (`enum(literal...)`).
    Enum {
        mask: Mask,
        values: Vec<serde_json::Value>,
    },
    /// A primitive carrying a named formatter (`format(name)`), resolved
    /// against a user-supplied formatter registry during parsing.
    Formatted { mask: Mask, format: &'static str },
    /// `object`, `entity`, `array`, `record`, or `union`.
    Complex(Arc<ComplexDef>),
}

impl TypeDef {
    pub fn mask(&self) -> Mask {
        match self {
            TypeDef::Bare(m) => *m,
            TypeDef::Const { mask, .. } => *mask,
            TypeDef::Enum { mask, .. } => *mask,
            TypeDef::Formatted { mask, .. } => *mask,
            TypeDef::Complex(c) => c.mask,
        }
    }

    pub fn shape_key(&self) -> u64 {
        match self {
            TypeDef::Complex(c) => c.shape_key,
            other => qcache_common::hash_shape(&canonical_scalar(other)),
        }
    }

    pub fn as_entity(&self) -> Option<&EntityShape> {
        match self {
            TypeDef::Complex(c) => match &c.kind {
                ComplexKind::Entity(shape) => Some(shape),
                _ => None,
            },
            _ => None,
        }
    }

    /// Adds `null`/`undefined`/both to the resolved mask of this definition,
    /// preserving its shape (§4.1 `optional`, `nullable`, `nullish`).
    pub fn optional(self) -> TypeDef {
        widen(self, Mask::UNDEFINED)
    }

    pub fn nullable(self) -> TypeDef {
        widen(self, Mask::NULL)
    }

    pub fn nullish(self) -> TypeDef {
        widen(self, Mask::NULL | Mask::UNDEFINED)
    }
}

fn widen(def: TypeDef, extra: Mask) -> TypeDef {
    match def {
        TypeDef::Bare(m) => TypeDef::Bare(m | extra),
        TypeDef::Const { mask, value } => TypeDef::Const { mask: mask | extra, value },
        TypeDef::Enum { mask, values } => TypeDef::Enum { mask: mask | extra, values },
        TypeDef::Formatted { mask, format } => TypeDef::Formatted { mask: mask | extra, format },
        TypeDef::Complex(c) => {
            let mut widened = (*c).clone();
            widened.mask |= extra;
            TypeDef::Complex(Arc::new(widened))
        }
    }
}

fn canonical_scalar(def: &TypeDef) -> String {
    match def {
        TypeDef::Bare(m) => format!("bare:{}", m.bits()),
        TypeDef::Const { value, .. } => format!("const:{value}"),
        TypeDef::Enum { values, .. } => {
            let mut rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
            rendered.sort();
            format!("enum:[{}]", rendered.join(","))
        }
        TypeDef::Formatted { mask, format } => format!("formatted:{}:{}", mask.bits(), format),
        TypeDef::Complex(_) => unreachable!("complex defs carry their own shape_key"),
    }
}

/// A non-bare definition — object, entity, array, record, or union.
#[derive(Clone, Debug)]
pub struct ComplexDef {
    pub mask: Mask,
    pub shape_key: u64,
    pub kind: ComplexKind,
}

#[derive(Clone, Debug)]
pub enum ComplexKind {
    Object { fields: BTreeMap<String, TypeDef> },
    Entity(EntityShape),
    Array { element: Arc<TypeDef> },
    Record { value: Arc<TypeDef> },
    Union(UnionShape),
}

/// Entity definitions expose their typename/id fields and a precomputed set
/// of sub-entity paths — fields that may transitively contain entities —
/// so the parser knows where to look without eagerly parsing everything.
#[derive(Clone, Debug)]
pub struct EntityShape {
    pub fields: BTreeMap<String, TypeDef>,
    pub typename_value: String,
    pub typename_field: String,
    pub id_field: String,
    pub sub_entity_paths: Vec<String>,
    pub stream: Option<StreamDescriptor>,
}

/// A union's dispatch table: keyed by typename discriminator, with reserved
/// slots for array- and record-valued branches and a literal-set dispatch
/// for value-kind-only unions.
#[derive(Clone, Debug, Default)]
pub struct UnionShape {
    pub by_typename: BTreeMap<String, TypeDef>,
    pub array_branch: Option<Arc<TypeDef>>,
    pub record_branch: Option<Arc<TypeDef>>,
    pub literal_branch: Option<Arc<TypeDef>>,
}

fn sub_entity_paths_of(fields: &BTreeMap<String, TypeDef>) -> Vec<String> {
    fields
        .iter()
        .filter(|(_, def)| def.mask().intersects(Mask::ENTITY | Mask::HAS_SUB_ENTITY))
        .map(|(name, _)| name.clone())
        .collect()
}

/// The immutable, built schema registry. Exposes `typename(X)` singleton
/// definitions and supports looking an entity shape back up by its
/// typename value, used by the parser to resolve union dispatch and by the
/// proxy layer to resolve `extend`-derived shapes.
pub struct TypeRegistry {
    entities_by_typename: BTreeMap<String, Arc<ComplexDef>>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    pub fn entity_shape(&self, typename_value: &str) -> Option<&EntityShape> {
        self.entities_by_typename.get(typename_value).and_then(|c| match &c.kind {
            ComplexKind::Entity(shape) => Some(shape),
            _ => None,
        })
    }
}

#[derive(Default)]
pub struct TypeRegistryBuilder {
    entities_by_typename: BTreeMap<String, Arc<ComplexDef>>,
}

impl TypeRegistryBuilder {
    /// Registers an entity definition under its typename value so later
    /// `typename(X)` lookups and cross-query proxy identity resolve to it.
    pub fn register_entity(mut self, def: &TypeDef) -> Self {
        if let TypeDef::Complex(c) = def {
            if let ComplexKind::Entity(shape) = &c.kind {
                self.entities_by_typename.insert(shape.typename_value.clone(), c.clone());
            }
        }
        self
    }

    /// The registry is immutable after `build()` (§4.1).
    pub fn build(self) -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry {
            entities_by_typename: self.entities_by_typename,
        })
    }
}
