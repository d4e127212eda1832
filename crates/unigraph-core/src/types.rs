//! Core data model for the Unigraph object graph.
//!
//! An [`Entity`] is a uid-identified, typed node wrapping a [`Value`].
//! Values form a tree: primitives at the leaves, arrays and objects of
//! entities above them, and nested typed entities where one schema embeds
//! another.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identifiers ───────────────────────────────────────────────────

/// Identifier of a graph node.
///
/// Either assigned by the store (opaque, e.g. `0x1a`) or a locally generated
/// placeholder in blank-node form (`_:<uuid>`) for nodes not yet persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Uid(pub String);

impl Uid {
    /// Prefix that marks a placeholder identifier.
    pub const PLACEHOLDER_PREFIX: &'static str = "_:";

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Generate a fresh placeholder, distinct from every store identifier.
    pub fn placeholder() -> Self {
        Self(format!("{}{}", Self::PLACEHOLDER_PREFIX, Uuid::new_v4().simple()))
    }

    pub fn is_placeholder(&self) -> bool {
        self.0.starts_with(Self::PLACEHOLDER_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

/// Caller-supplied identifier of a live query.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SubscriptionId(pub i64);

impl SubscriptionId {
    /// A random, process-unique-in-practice subscription id.
    pub fn random() -> Self {
        let bits = Uuid::new_v4().as_u128() as u64;
        Self((bits >> 1) as i64)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation id of a one-shot request. Lives in its own namespace,
/// separate from subscription ids.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference from an entity to its schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TypeRef {
    #[serde(rename = "unigraph.id")]
    pub unigraph_id: String,
}

impl TypeRef {
    pub fn new(unigraph_id: impl Into<String>) -> Self {
        Self {
            unigraph_id: unigraph_id.into(),
        }
    }
}

// ── Primitives ────────────────────────────────────────────────────

/// Kind discriminator of a primitive value.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PrimitiveKind {
    /// Integral number: `_value.#i`
    Int,
    /// Floating point number: `_value.#`
    Number,
    /// `_value.!`
    Boolean,
    /// `_value.%`
    String,
    /// RFC 3339 timestamp carried as a string: `_value.%dt`
    Datetime,
    /// `_value.null`
    Null,
    /// `_value.undefined`
    Undefined,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 7] = [
        Self::Int,
        Self::Number,
        Self::Boolean,
        Self::String,
        Self::Datetime,
        Self::Null,
        Self::Undefined,
    ];

    /// Wire key carrying a primitive of this kind.
    pub fn wire_key(&self) -> &'static str {
        match self {
            Self::Int => "_value.#i",
            Self::Number => "_value.#",
            Self::Boolean => "_value.!",
            Self::String => "_value.%",
            Self::Datetime => "_value.%dt",
            Self::Null => "_value.null",
            Self::Undefined => "_value.undefined",
        }
    }

    /// Parse a wire key. `_value.?` is the legacy boolean spelling.
    pub fn from_wire_key(key: &str) -> Option<Self> {
        if key == "_value.?" {
            return Some(Self::Boolean);
        }
        Self::ALL.into_iter().find(|kind| kind.wire_key() == key)
    }

    /// Built-in schema id for this kind.
    pub fn schema_id(&self) -> &'static str {
        match self {
            Self::Int | Self::Number => "$/primitive/number",
            Self::Boolean => "$/primitive/boolean",
            Self::String => "$/primitive/string",
            Self::Datetime => "$/primitive/datetime",
            Self::Null => "$/primitive/null",
            Self::Undefined => "$/primitive/undefined",
        }
    }

    /// Infer the kind of a plain JSON scalar. Composite shapes yield `None`.
    pub fn infer(raw: &serde_json::Value) -> Option<Self> {
        match raw {
            serde_json::Value::Null => Some(Self::Null),
            serde_json::Value::Bool(_) => Some(Self::Boolean),
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Some(Self::Int),
            serde_json::Value::Number(_) => Some(Self::Number),
            serde_json::Value::String(_) => Some(Self::String),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => None,
        }
    }

    /// Whether `raw` is a valid payload for this kind.
    pub fn accepts(&self, raw: &serde_json::Value) -> bool {
        match self {
            Self::Int => raw.is_i64() || raw.is_u64(),
            Self::Number => raw.is_number(),
            Self::Boolean => raw.is_boolean(),
            Self::String => raw.is_string(),
            Self::Datetime => raw
                .as_str()
                .is_some_and(|s| chrono::DateTime::parse_from_rfc3339(s).is_ok()),
            Self::Null | Self::Undefined => raw.is_null(),
        }
    }
}

impl fmt::Display for PrimitiveKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Int => "int",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Datetime => "datetime",
            Self::Null => "null",
            Self::Undefined => "undefined",
        };
        f.write_str(name)
    }
}

/// A primitive leaf: kind tag plus raw JSON scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Primitive {
    pub kind: PrimitiveKind,
    pub raw: serde_json::Value,
}

impl Primitive {
    pub fn new(kind: PrimitiveKind, raw: serde_json::Value) -> Self {
        Self { kind, raw }
    }
}

// ── Entities and values ───────────────────────────────────────────

/// A uid-identified, typed graph node wrapping a [`Value`].
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub uid: Option<Uid>,
    pub type_ref: Option<TypeRef>,
    /// Soft-delete / visibility flag (`_hide`).
    pub hide: bool,
    pub value: Value,
}

impl Entity {
    /// An untyped, unidentified entity around `value`.
    pub fn new(value: Value) -> Self {
        Self {
            uid: None,
            type_ref: None,
            hide: false,
            value,
        }
    }

    pub fn with_type(mut self, unigraph_id: impl Into<String>) -> Self {
        self.type_ref = Some(TypeRef::new(unigraph_id));
        self
    }

    pub fn with_uid(mut self, uid: Uid) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn primitive(kind: PrimitiveKind, raw: serde_json::Value) -> Self {
        Self::new(Value::Primitive(Primitive::new(kind, raw)))
    }

    pub fn type_id(&self) -> Option<&str> {
        self.type_ref.as_ref().map(|t| t.unigraph_id.as_str())
    }

    /// Follow nested-entity links down to the first non-link value.
    pub fn innermost(&self) -> &Entity {
        let mut current = self;
        while let Value::Entity(inner) = &current.value {
            current = inner;
        }
        current
    }

    pub fn innermost_mut(&mut self) -> &mut Entity {
        match self.value {
            Value::Entity(ref mut inner) => inner.innermost_mut(),
            _ => self,
        }
    }

    /// Visit this entity and every entity beneath it, parents first.
    pub fn walk_mut(&mut self, visit: &mut dyn FnMut(&mut Entity)) {
        visit(self);
        match &mut self.value {
            Value::Entity(inner) => inner.walk_mut(visit),
            Value::Object(obj) => {
                for field in obj.fields.values_mut() {
                    field.walk_mut(visit);
                }
            }
            Value::Array(items) => {
                for item in items {
                    item.value.walk_mut(visit);
                }
            }
            Value::Primitive(_) | Value::Raw(_) => {}
        }
    }
}

/// Tagged content of an entity. The tag never changes in place.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Primitive(Primitive),
    /// Ordered by `index`, not by position in the vector.
    Array(Vec<ArrayItem>),
    Object(ObjectValue),
    /// A nested typed entity (one schema embedding another).
    Entity(Box<Entity>),
    /// Payload kept verbatim because its schema is not (yet) known locally.
    Raw(serde_json::Value),
}

impl Value {
    /// Short name of the variant, for logs and errors.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Primitive(_) => "primitive",
            Self::Array(_) => "array",
            Self::Object(_) => "object",
            Self::Entity(_) => "entity",
            Self::Raw(_) => "raw",
        }
    }
}

/// Object content: named fields, each an entity. Field order carries no meaning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectValue {
    /// Uid of the node holding the fields, when the store returned it.
    pub uid: Option<Uid>,
    pub fields: BTreeMap<String, Entity>,
}

/// One slot of an array value.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayItem {
    pub uid: Option<Uid>,
    pub index: i64,
    /// Optional name for the element; does not affect position.
    pub key: Option<String>,
    pub hide: bool,
    pub value: Entity,
}

impl ArrayItem {
    pub fn new(index: i64, value: Entity) -> Self {
        Self {
            uid: None,
            index,
            key: None,
            hide: false,
            value,
        }
    }

    /// Hidden either through the slot itself or the element it holds.
    pub fn is_hidden(&self) -> bool {
        self.hide || self.value.hide
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn placeholder_uids_are_distinct_and_marked() {
        let a = Uid::placeholder();
        let b = Uid::placeholder();
        assert_ne!(a, b);
        assert!(a.is_placeholder());
        assert!(!Uid::from("0x1a").is_placeholder());
    }

    #[test]
    fn wire_keys_parse_back() {
        for kind in PrimitiveKind::ALL {
            assert_eq!(PrimitiveKind::from_wire_key(kind.wire_key()), Some(kind));
        }
        assert_eq!(
            PrimitiveKind::from_wire_key("_value.?"),
            Some(PrimitiveKind::Boolean)
        );
        assert_eq!(PrimitiveKind::from_wire_key("_value.~"), None);
    }

    #[test]
    fn infer_distinguishes_int_and_float() {
        assert_eq!(PrimitiveKind::infer(&json!(3)), Some(PrimitiveKind::Int));
        assert_eq!(PrimitiveKind::infer(&json!(3.5)), Some(PrimitiveKind::Number));
        assert_eq!(PrimitiveKind::infer(&json!("x")), Some(PrimitiveKind::String));
        assert_eq!(PrimitiveKind::infer(&json!([1])), None);
    }

    #[test]
    fn datetime_accepts_only_rfc3339() {
        assert!(PrimitiveKind::Datetime.accepts(&json!("2021-03-01T10:00:00Z")));
        assert!(!PrimitiveKind::Datetime.accepts(&json!("next friday")));
    }

    #[test]
    fn type_ref_serializes_with_unigraph_id_key() {
        let json = serde_json::to_value(TypeRef::new("$/schema/todo")).unwrap();
        assert_eq!(json, json!({"unigraph.id": "$/schema/todo"}));
    }

    #[test]
    fn innermost_follows_entity_links() {
        let leaf = Entity::primitive(PrimitiveKind::String, json!("hi"));
        let wrapped = Entity::new(Value::Entity(Box::new(leaf.clone()))).with_type("$/schema/note");
        assert_eq!(wrapped.innermost(), &leaf);
    }
}
