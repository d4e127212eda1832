//! Value codec: wire form ↔ typed [`Entity`] ↔ plain JSON.
//!
//! - [`decode`] / [`encode`] convert between the store's JSON wire form and
//!   the typed [`Entity`] tree.
//! - [`pad`] / [`pad_as`] build an entity from a plain nested value, either by
//!   inspecting the JSON shape or directed by a schema definition.
//! - [`unpad`] flattens an entity back to plain JSON.
//!
//! Everything here is pure. Schema knowledge is supplied by the caller
//! through [`SchemaSource`].

use std::collections::BTreeMap;

use serde_json::{Map, Value as Json};

use crate::schema::SchemaDefinition;
use crate::types::{ArrayItem, Entity, ObjectValue, Primitive, PrimitiveKind, TypeRef, Uid, Value};

pub const UID: &str = "uid";
pub const TYPE: &str = "type";
pub const HIDE: &str = "_hide";
pub const VALUE: &str = "_value";
pub const ARRAY: &str = "_value[";
pub const INDEX: &str = "_index";
pub const KEY: &str = "_key";
pub const UNIGRAPH_ID: &str = "unigraph.id";
const DGRAPH_TYPE: &str = "dgraph.type";
const PRIMITIVE_PREFIX: &str = "_value.";

/// Errors from encoding, decoding and path access.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("Malformed entity at {path}: {reason}")]
    MalformedEntity { path: String, reason: String },

    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    #[error("Kind mismatch at {path}: expected {expected}, found {found}")]
    KindMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("Path not found: {0}")]
    PathNotFound(String),

    #[error("Reserved field name at {path}: {name}")]
    ReservedField { path: String, name: String },
}

impl CodecError {
    fn malformed(path: &str, reason: impl Into<String>) -> Self {
        Self::MalformedEntity {
            path: if path.is_empty() { "$".to_string() } else { path.to_string() },
            reason: reason.into(),
        }
    }
}

/// Read access to schema definitions.
pub trait SchemaSource {
    fn definition(&self, unigraph_id: &str) -> Option<SchemaDefinition>;
}

/// Options for [`unpad`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnpadOptions {
    /// Include array entries marked `_hide`.
    pub show_hidden: bool,
}

impl UnpadOptions {
    pub fn show_hidden(show_hidden: bool) -> Self {
        Self { show_hidden }
    }
}

// ── Decoding ─────────────────────────────────────────────────────

/// A leniently decoded entity and the subtrees that had to be kept raw.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub entity: Entity,
    /// One error per field or array element kept as [`Value::Raw`].
    pub malformed: Vec<CodecError>,
}

/// Decode a wire entity strictly: any undeterminable tag is an error.
pub fn decode(wire: &Json) -> Result<Entity, CodecError> {
    Decoder::strict(None).entity(wire, "")
}

/// Decode a wire entity, keeping payloads of entities whose schema is not
/// known to `schemas` verbatim instead of failing.
pub fn decode_with(wire: &Json, schemas: &dyn SchemaSource) -> Result<Entity, CodecError> {
    Decoder::strict(Some(schemas)).entity(wire, "")
}

/// Decode a wire entity, containing failures to the subtree they occur in.
///
/// A malformed field or array element is kept as [`Value::Raw`] and
/// reported in [`Decoded::malformed`]; its siblings decode normally. Only a
/// root that cannot be decoded at all is an error.
pub fn decode_contained(wire: &Json, schemas: &dyn SchemaSource) -> Result<Decoded, CodecError> {
    let mut decoder = Decoder {
        schemas: Some(schemas),
        malformed: Some(Vec::new()),
    };
    let entity = decoder.entity(wire, "")?;
    Ok(Decoded {
        entity,
        malformed: decoder.malformed.unwrap_or_default(),
    })
}

struct Decoder<'a> {
    schemas: Option<&'a dyn SchemaSource>,
    /// `None` in strict mode.
    malformed: Option<Vec<CodecError>>,
}

impl<'a> Decoder<'a> {
    fn strict(schemas: Option<&'a dyn SchemaSource>) -> Self {
        Self {
            schemas,
            malformed: None,
        }
    }

    /// Record `err` for a contained subtree. Hands it back in strict mode.
    fn contain(&mut self, path: &str, err: CodecError) -> Result<(), CodecError> {
        match self.malformed.as_mut() {
            Some(malformed) => {
                tracing::warn!(path = %display_path(path), error = %err, "Keeping malformed value raw");
                malformed.push(err);
                Ok(())
            }
            None => Err(err),
        }
    }

    /// Decode a field or array element.
    fn child(&mut self, wire: &Json, path: &str) -> Result<Entity, CodecError> {
        match self.entity(wire, path) {
            Ok(entity) => Ok(entity),
            Err(err) => {
                self.contain(path, err)?;
                let mut raw = Entity::new(Value::Raw(wire.clone()));
                raw.uid = wire.get(UID).and_then(Json::as_str).map(Uid::from);
                Ok(raw)
            }
        }
    }

    fn entity(&mut self, wire: &Json, path: &str) -> Result<Entity, CodecError> {
        let obj = wire
            .as_object()
            .ok_or_else(|| CodecError::malformed(path, format!("expected object, found {wire}")))?;

        let uid = obj.get(UID).and_then(Json::as_str).map(Uid::from);
        let type_ref = type_link(obj).map(TypeRef::new);
        let hide = obj.get(HIDE).and_then(Json::as_bool).unwrap_or(false);

        match self.payload(obj, path) {
            Ok(value) => Ok(Entity {
                uid,
                type_ref,
                hide,
                value,
            }),
            Err(err) => match (&type_ref, self.schemas) {
                (Some(t), Some(source)) if source.definition(&t.unigraph_id).is_none() => {
                    tracing::debug!(
                        path = %display_path(path),
                        unigraph_id = %t.unigraph_id,
                        "Unknown schema, keeping raw payload"
                    );
                    Ok(Entity {
                        uid,
                        type_ref,
                        hide,
                        value: Value::Raw(wire.clone()),
                    })
                }
                _ => Err(err),
            },
        }
    }

    fn payload(&mut self, obj: &Map<String, Json>, path: &str) -> Result<Value, CodecError> {
        if let Some(items) = obj.get(ARRAY) {
            return self.array(items, path);
        }

        if let Some((key, raw)) = obj.iter().find(|(k, _)| k.starts_with(PRIMITIVE_PREFIX)) {
            let kind = PrimitiveKind::from_wire_key(key)
                .ok_or_else(|| CodecError::malformed(path, format!("unknown primitive tag {key}")))?;
            if !kind.accepts(raw) {
                return Err(CodecError::malformed(
                    path,
                    format!("{raw} is not a valid {kind}"),
                ));
            }
            return Ok(Value::Primitive(Primitive::new(kind, raw.clone())));
        }

        match obj.get(VALUE) {
            Some(Json::Object(inner)) if looks_like_entity(inner) => {
                let nested = self.entity(&Json::Object(inner.clone()), path)?;
                Ok(Value::Entity(Box::new(nested)))
            }
            Some(Json::Object(inner)) => self.object(inner, path),
            Some(other) => Err(CodecError::malformed(
                path,
                format!("_value must be an object, found {other}"),
            )),
            None => Err(CodecError::malformed(path, "no payload tag")),
        }
    }

    fn object(&mut self, inner: &Map<String, Json>, path: &str) -> Result<Value, CodecError> {
        let mut object = ObjectValue {
            uid: inner.get(UID).and_then(Json::as_str).map(Uid::from),
            fields: BTreeMap::new(),
        };
        for (name, field) in inner {
            if name == UID || name == DGRAPH_TYPE {
                continue;
            }
            let child = self.child(field, &join(path, name))?;
            object.fields.insert(name.clone(), child);
        }
        Ok(Value::Object(object))
    }

    fn array(&mut self, items: &Json, path: &str) -> Result<Value, CodecError> {
        let list = items
            .as_array()
            .ok_or_else(|| CodecError::malformed(path, "_value[ must be a list"))?;

        let mut out = Vec::with_capacity(list.len());
        for (position, item) in list.iter().enumerate() {
            let item_path = join(path, &position.to_string());
            match self.array_item(item, position, &item_path) {
                Ok(slot) => out.push(slot),
                // A slot without a usable index or payload has no place to go.
                Err(err) => self.contain(&item_path, err)?,
            }
        }
        Ok(Value::Array(out))
    }

    fn array_item(&mut self, item: &Json, position: usize, path: &str) -> Result<ArrayItem, CodecError> {
        let slot = item
            .as_object()
            .ok_or_else(|| CodecError::malformed(path, "array item must be an object"))?;
        let index = match slot.get(INDEX) {
            Some(Json::Number(n)) => n.as_i64(),
            Some(Json::Object(tagged)) => tagged
                .get(PrimitiveKind::Int.wire_key())
                .and_then(Json::as_i64),
            None => Some(position as i64),
            Some(_) => None,
        }
        .ok_or_else(|| CodecError::malformed(path, "invalid _index"))?;
        let element = slot
            .get(VALUE)
            .ok_or_else(|| CodecError::malformed(path, "array item without _value"))?;

        Ok(ArrayItem {
            uid: slot.get(UID).and_then(Json::as_str).map(Uid::from),
            index,
            key: slot.get(KEY).and_then(Json::as_str).map(str::to_string),
            hide: slot.get(HIDE).and_then(Json::as_bool).unwrap_or(false),
            value: self.child(element, path)?,
        })
    }
}

/// The `unigraph.id` of a `type` link, if `obj` carries one.
fn type_link(obj: &Map<String, Json>) -> Option<&str> {
    obj.get(TYPE)?.get(UNIGRAPH_ID)?.as_str()
}

/// A `_value` object is a nested entity when it carries a payload tag or a
/// type link of its own; otherwise its keys are object fields. A padded
/// field named `type` never holds `unigraph.id` directly.
fn looks_like_entity(inner: &Map<String, Json>) -> bool {
    inner.keys().any(|k| k.starts_with(VALUE)) || type_link(inner).is_some()
}

/// Whether `name` collides with the wire form of an object node.
pub fn is_reserved_field(name: &str) -> bool {
    name == UID || name == HIDE || name == DGRAPH_TYPE || name.starts_with(VALUE)
}

// ── Encoding ─────────────────────────────────────────────────────

/// Encode an entity into wire form.
pub fn encode(entity: &Entity) -> Json {
    if let Value::Raw(raw) = &entity.value {
        return raw.clone();
    }

    let mut obj = Map::new();
    if let Some(uid) = &entity.uid {
        obj.insert(UID.into(), Json::String(uid.0.clone()));
    }
    if let Some(t) = &entity.type_ref {
        let mut type_obj = Map::new();
        type_obj.insert(UNIGRAPH_ID.into(), Json::String(t.unigraph_id.clone()));
        obj.insert(TYPE.into(), Json::Object(type_obj));
    }
    if entity.hide {
        obj.insert(HIDE.into(), Json::Bool(true));
    }

    match &entity.value {
        Value::Primitive(p) => {
            obj.insert(p.kind.wire_key().into(), p.raw.clone());
        }
        Value::Entity(inner) => {
            obj.insert(VALUE.into(), encode(inner));
        }
        Value::Object(object) => {
            let mut fields = Map::new();
            for (name, field) in &object.fields {
                fields.insert(name.clone(), encode(field));
            }
            if let Some(uid) = &object.uid {
                fields.insert(UID.into(), Json::String(uid.0.clone()));
            }
            obj.insert(VALUE.into(), Json::Object(fields));
        }
        Value::Array(items) => {
            let list = items.iter().map(encode_item).collect();
            obj.insert(ARRAY.into(), Json::Array(list));
        }
        Value::Raw(_) => unreachable!("handled above"),
    }
    Json::Object(obj)
}

pub(crate) fn encode_index(index: i64) -> Json {
    let mut tagged = Map::new();
    tagged.insert(PrimitiveKind::Int.wire_key().into(), Json::from(index));
    Json::Object(tagged)
}

fn encode_item(item: &ArrayItem) -> Json {
    let mut slot = Map::new();
    if let Some(uid) = &item.uid {
        slot.insert(UID.into(), Json::String(uid.0.clone()));
    }
    slot.insert(INDEX.into(), encode_index(item.index));
    if let Some(key) = &item.key {
        slot.insert(KEY.into(), Json::String(key.clone()));
    }
    if item.hide {
        slot.insert(HIDE.into(), Json::Bool(true));
    }
    slot.insert(VALUE.into(), encode(&item.value));
    Json::Object(slot)
}

// ── Padding ──────────────────────────────────────────────────────

/// Pad a plain value by inspecting its JSON shape.
///
/// Arrays get contiguous indices from 0 in input order. No uid or type is
/// invented. Object keys that collide with the wire form (see
/// [`is_reserved_field`]) are rejected.
pub fn pad(plain: &Json) -> Result<Entity, CodecError> {
    pad_shape(plain, "")
}

fn pad_shape(plain: &Json, path: &str) -> Result<Entity, CodecError> {
    match plain {
        Json::Array(list) => {
            let mut items = Vec::with_capacity(list.len());
            for (i, element) in list.iter().enumerate() {
                items.push(ArrayItem::new(i as i64, pad_shape(element, &join(path, &i.to_string()))?));
            }
            Ok(Entity::new(Value::Array(items)))
        }
        Json::Object(map) => {
            let mut object = ObjectValue::default();
            for (name, value) in map {
                check_field_name(path, name)?;
                object
                    .fields
                    .insert(name.clone(), pad_shape(value, &join(path, name))?);
            }
            Ok(Entity::new(Value::Object(object)))
        }
        scalar => {
            // infer() only returns None for arrays and objects, handled above.
            let kind = PrimitiveKind::infer(scalar).unwrap_or(PrimitiveKind::Null);
            Ok(Entity::primitive(kind, scalar.clone()))
        }
    }
}

fn check_field_name(path: &str, name: &str) -> Result<(), CodecError> {
    if is_reserved_field(name) {
        return Err(CodecError::ReservedField {
            path: display_path(path),
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Pad a plain value following a schema definition.
///
/// Referenced schemas are resolved through `schemas`; a reference to an
/// unknown schema pads by shape and keeps the type link.
pub fn pad_as(
    plain: &Json,
    definition: &SchemaDefinition,
    schemas: &dyn SchemaSource,
) -> Result<Entity, CodecError> {
    pad_at(plain, definition, schemas, "")
}

fn pad_at(
    plain: &Json,
    definition: &SchemaDefinition,
    schemas: &dyn SchemaSource,
    path: &str,
) -> Result<Entity, CodecError> {
    match definition {
        SchemaDefinition::Any => pad_shape(plain, path),
        SchemaDefinition::Primitive { primitive } => {
            if !primitive.accepts(plain) {
                return Err(CodecError::KindMismatch {
                    path: display_path(path),
                    expected: primitive.to_string(),
                    found: describe(plain),
                });
            }
            Ok(Entity::primitive(*primitive, plain.clone()))
        }
        SchemaDefinition::Array { element } => {
            let list = plain.as_array().ok_or_else(|| CodecError::KindMismatch {
                path: display_path(path),
                expected: "array".into(),
                found: describe(plain),
            })?;
            let mut items = Vec::with_capacity(list.len());
            for (i, entry) in list.iter().enumerate() {
                let padded = pad_at(entry, element, schemas, &join(path, &i.to_string()))?;
                items.push(ArrayItem::new(i as i64, padded));
            }
            Ok(Entity::new(Value::Array(items)))
        }
        SchemaDefinition::Object { fields } => {
            let map = plain.as_object().ok_or_else(|| CodecError::KindMismatch {
                path: display_path(path),
                expected: "object".into(),
                found: describe(plain),
            })?;
            let mut object = ObjectValue::default();
            for (name, value) in map {
                check_field_name(path, name)?;
                let padded = match fields.get(name) {
                    Some(field_def) => pad_at(value, field_def, schemas, &join(path, name))?,
                    None => {
                        tracing::debug!(path = %display_path(path), field = %name, "Field not in schema, padding by shape");
                        pad_shape(value, &join(path, name))?
                    }
                };
                object.fields.insert(name.clone(), padded);
            }
            Ok(Entity::new(Value::Object(object)))
        }
        SchemaDefinition::Reference { unigraph_id } => {
            let inner = match schemas.definition(unigraph_id) {
                Some(def) => pad_at(plain, &def, schemas, path)?,
                None => {
                    tracing::warn!(unigraph_id = %unigraph_id, "Padding against unknown schema by shape");
                    pad_shape(plain, path)?
                }
            };
            Ok(Entity::new(Value::Entity(Box::new(inner.with_type(unigraph_id.clone())))))
        }
    }
}

// ── Unpadding ────────────────────────────────────────────────────

/// Flatten an entity into plain JSON.
///
/// Arrays come out sorted by `index`. Hidden entries are dropped unless
/// `options.show_hidden` is set; they keep their index either way.
pub fn unpad(entity: &Entity, options: UnpadOptions) -> Json {
    match &entity.value {
        Value::Primitive(p) => p.raw.clone(),
        Value::Entity(inner) => unpad(inner, options),
        Value::Object(object) => Json::Object(
            object
                .fields
                .iter()
                .map(|(name, field)| (name.clone(), unpad(field, options)))
                .collect(),
        ),
        Value::Array(items) => {
            let mut visible: Vec<&ArrayItem> = items
                .iter()
                .filter(|item| options.show_hidden || !item.is_hidden())
                .collect();
            visible.sort_by_key(|item| item.index);
            Json::Array(visible.into_iter().map(|item| unpad(&item.value, options)).collect())
        }
        Value::Raw(raw) => raw.get(VALUE).cloned().unwrap_or_else(|| raw.clone()),
    }
}

// ── Helpers ──────────────────────────────────────────────────────

pub(crate) fn join(path: &str, segment: &str) -> String {
    if path.is_empty() {
        segment.to_string()
    } else {
        format!("{path}.{segment}")
    }
}

fn display_path(path: &str) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        path.to_string()
    }
}

pub(crate) fn describe(raw: &Json) -> String {
    match raw {
        Json::Array(_) => "array".into(),
        Json::Object(_) => "object".into(),
        scalar => PrimitiveKind::infer(scalar)
            .map(|k| k.to_string())
            .unwrap_or_else(|| "unknown".into()),
    }
}
