//! Typed object wrapper: lazy, path-based access over a padded entity.
//!
//! A [`UnigraphObject`] owns its entity; two wrappers built from the same
//! entity never share mutable state. Reads walk only the part of the tree
//! the path names. Writes go through [`UnigraphObject::set`], which keeps
//! the primitive kind fixed and records the path as dirty so the mutation
//! engine can turn it into a partial update.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value as Json};

use crate::codec::{self, describe, encode_index, CodecError, UnpadOptions};
use crate::schema::{Schema, SchemaCatalog};
use crate::types::{Entity, Uid, Value};

/// A path into an object: field names and array positions.
///
/// Array segments match an element's `index` when numeric, otherwise its
/// `_key`.
pub type Path = Vec<String>;

/// Split a dotted path (`"time_frame.start.datetime"`) into segments.
pub fn parse_path(path: &str) -> Path {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Result of a path lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Field<'a> {
    /// Raw JSON scalar of a primitive.
    Primitive(&'a Json),
    /// A composite sub-value, viewed without copying.
    Object(ObjectView<'a>),
}

impl<'a> Field<'a> {
    pub fn as_primitive(&self) -> Option<&'a Json> {
        match self {
            Field::Primitive(raw) => Some(raw),
            Field::Object(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&'a str> {
        self.as_primitive().and_then(Json::as_str)
    }

    pub fn as_object(&self) -> Option<&ObjectView<'a>> {
        match self {
            Field::Object(view) => Some(view),
            Field::Primitive(_) => None,
        }
    }
}

/// Borrowed view over a composite sub-tree of an object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectView<'a> {
    entity: &'a Entity,
    show_hidden: bool,
}

impl<'a> ObjectView<'a> {
    pub fn entity(&self) -> &'a Entity {
        self.entity
    }

    pub fn uid(&self) -> Option<&'a Uid> {
        self.entity.uid.as_ref()
    }

    pub fn type_id(&self) -> Option<&'a str> {
        self.entity.type_id()
    }

    pub fn get(&self, path: &str) -> Result<Field<'a>, CodecError> {
        lookup(self.entity, &parse_path(path), self.show_hidden)
    }

    pub fn unpad(&self) -> Json {
        codec::unpad(self.entity, UnpadOptions::show_hidden(self.show_hidden))
    }

    /// Copy this sub-tree into an independent wrapper.
    pub fn to_object(&self, catalog: Arc<SchemaCatalog>) -> UnigraphObject {
        UnigraphObject::new(self.entity.clone(), catalog).with_show_hidden(self.show_hidden)
    }
}

/// Owned, typed wrapper over a padded entity.
#[derive(Clone)]
pub struct UnigraphObject {
    entity: Entity,
    catalog: Arc<SchemaCatalog>,
    show_hidden: bool,
    dirty: BTreeSet<Path>,
    hide_dirty: bool,
}

impl std::fmt::Debug for UnigraphObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnigraphObject")
            .field("uid", &self.entity.uid)
            .field("type", &self.entity.type_id())
            .field("dirty", &self.dirty)
            .finish()
    }
}

impl UnigraphObject {
    pub fn new(entity: Entity, catalog: Arc<SchemaCatalog>) -> Self {
        Self {
            entity,
            catalog,
            show_hidden: false,
            dirty: BTreeSet::new(),
            hide_dirty: false,
        }
    }

    pub fn with_show_hidden(mut self, show_hidden: bool) -> Self {
        self.show_hidden = show_hidden;
        self
    }

    pub fn entity(&self) -> &Entity {
        &self.entity
    }

    pub fn into_entity(self) -> Entity {
        self.entity
    }

    pub fn uid(&self) -> Option<&Uid> {
        self.entity.uid.as_ref()
    }

    pub fn type_id(&self) -> Option<&str> {
        self.entity.type_id()
    }

    pub fn is_hidden(&self) -> bool {
        self.entity.hide
    }

    /// Schema of this object's type, when the catalog knows it.
    pub fn schema(&self) -> Option<Schema> {
        self.type_id().and_then(|id| self.catalog.lookup(id))
    }

    /// Raw value when the whole object is a primitive.
    pub fn as_primitive(&self) -> Option<&Json> {
        match &self.entity.innermost().value {
            Value::Primitive(p) => Some(&p.raw),
            _ => None,
        }
    }

    /// Resolve a dotted path.
    pub fn get(&self, path: &str) -> Result<Field<'_>, CodecError> {
        self.get_path(&parse_path(path))
    }

    pub fn get_path(&self, path: &[String]) -> Result<Field<'_>, CodecError> {
        lookup(&self.entity, path, self.show_hidden)
    }

    /// Plain form of the whole object.
    pub fn unpad(&self) -> Json {
        codec::unpad(&self.entity, UnpadOptions::show_hidden(self.show_hidden))
    }

    /// Overwrite the primitive at `path`.
    ///
    /// The location must already exist and `raw` must fit its kind. Marks
    /// the path dirty; issuing the update is left to the mutation engine.
    pub fn set(&mut self, path: &str, raw: Json) -> Result<(), CodecError> {
        let segments = parse_path(path);
        let display = segments.join(".");
        let target = lookup_mut(&mut self.entity, &segments, self.show_hidden)?.innermost_mut();
        let found = target.value.tag();
        let Value::Primitive(prim) = &mut target.value else {
            return Err(CodecError::KindMismatch {
                path: display,
                expected: "primitive".into(),
                found: found.into(),
            });
        };
        if !prim.kind.accepts(&raw) {
            return Err(CodecError::KindMismatch {
                path: display,
                expected: prim.kind.to_string(),
                found: describe(&raw),
            });
        }
        if prim.raw != raw {
            prim.raw = raw;
            self.dirty.insert(segments);
        }
        Ok(())
    }

    /// Mark the object hidden or visible.
    pub fn set_hidden(&mut self, hide: bool) {
        if self.entity.hide != hide {
            self.entity.hide = hide;
            self.hide_dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.hide_dirty || !self.dirty.is_empty()
    }

    pub fn dirty_paths(&self) -> impl Iterator<Item = &Path> {
        self.dirty.iter()
    }

    pub fn clear_dirty(&mut self) {
        self.dirty.clear();
        self.hide_dirty = false;
    }

    /// Partial wire payload covering only the dirty locations.
    ///
    /// Every node on the way carries its uid so the store can address it.
    /// The root's own uid is left out; it is passed separately to the update.
    pub fn dirty_patch(&self) -> Option<Json> {
        if !self.is_dirty() {
            return None;
        }
        let paths: Vec<&[String]> = self.dirty.iter().map(Vec::as_slice).collect();
        let mut patch = match patch_node(&self.entity, &paths, self.show_hidden) {
            Json::Object(map) => map,
            _ => Map::new(),
        };
        patch.remove(codec::UID);
        if self.hide_dirty {
            patch.insert(codec::HIDE.into(), Json::Bool(self.entity.hide));
        }
        Some(Json::Object(patch))
    }
}

// ── Navigation ───────────────────────────────────────────────────

fn not_found(path: &[String], depth: usize) -> CodecError {
    CodecError::PathNotFound(path[..=depth.min(path.len().saturating_sub(1))].join("."))
}

fn step<'e>(
    entity: &'e Entity,
    segment: &str,
    show_hidden: bool,
) -> Option<&'e Entity> {
    match &entity.innermost().value {
        Value::Object(obj) => obj.fields.get(segment),
        Value::Array(items) => {
            let by_index = segment.parse::<i64>().ok();
            items
                .iter()
                .filter(|item| show_hidden || !item.is_hidden())
                .find(|item| match by_index {
                    Some(n) => item.index == n,
                    None => item.key.as_deref() == Some(segment),
                })
                .map(|item| &item.value)
        }
        _ => None,
    }
}

fn lookup<'e>(
    entity: &'e Entity,
    path: &[String],
    show_hidden: bool,
) -> Result<Field<'e>, CodecError> {
    let mut current = entity;
    for (depth, segment) in path.iter().enumerate() {
        current = step(current, segment, show_hidden).ok_or_else(|| not_found(path, depth))?;
    }
    Ok(match &current.innermost().value {
        Value::Primitive(p) => Field::Primitive(&p.raw),
        _ => Field::Object(ObjectView {
            entity: current,
            show_hidden,
        }),
    })
}

fn lookup_mut<'e>(
    entity: &'e mut Entity,
    path: &[String],
    show_hidden: bool,
) -> Result<&'e mut Entity, CodecError> {
    let mut current = entity;
    for (depth, segment) in path.iter().enumerate() {
        let next = match &mut current.innermost_mut().value {
            Value::Object(obj) => obj.fields.get_mut(segment.as_str()),
            Value::Array(items) => {
                let by_index = segment.parse::<i64>().ok();
                items
                    .iter_mut()
                    .filter(|item| show_hidden || !item.is_hidden())
                    .find(|item| match by_index {
                        Some(n) => item.index == n,
                        None => item.key.as_deref() == Some(segment.as_str()),
                    })
                    .map(|item| &mut item.value)
            }
            _ => None,
        };
        current = next.ok_or_else(|| not_found(path, depth))?;
    }
    Ok(current)
}

/// Build the wire sub-tree for `entity` restricted to `paths` (relative to it).
fn patch_node(entity: &Entity, paths: &[&[String]], show_hidden: bool) -> Json {
    let mut node = Map::new();
    if let Some(uid) = &entity.uid {
        node.insert(codec::UID.into(), Json::String(uid.0.clone()));
    }

    match &entity.value {
        Value::Entity(inner) => {
            node.insert(codec::VALUE.into(), patch_node(inner, paths, show_hidden));
        }
        Value::Primitive(p) => {
            node.insert(p.kind.wire_key().into(), p.raw.clone());
        }
        Value::Object(obj) => {
            let mut fields = Map::new();
            if let Some(uid) = &obj.uid {
                fields.insert(codec::UID.into(), Json::String(uid.0.clone()));
            }
            for (name, field) in &obj.fields {
                let tails = tails_for(paths, |seg| seg == name);
                if !tails.is_empty() {
                    fields.insert(name.clone(), patch_node(field, &tails, show_hidden));
                }
            }
            node.insert(codec::VALUE.into(), Json::Object(fields));
        }
        Value::Array(items) => {
            let mut slots = Vec::new();
            for item in items.iter().filter(|i| show_hidden || !i.is_hidden()) {
                let tails = tails_for(paths, |seg| match seg.parse::<i64>() {
                    Ok(n) => n == item.index,
                    Err(_) => item.key.as_deref() == Some(seg),
                });
                if tails.is_empty() {
                    continue;
                }
                let mut slot = Map::new();
                if let Some(uid) = &item.uid {
                    slot.insert(codec::UID.into(), Json::String(uid.0.clone()));
                }
                slot.insert(codec::INDEX.into(), encode_index(item.index));
                slot.insert(codec::VALUE.into(), patch_node(&item.value, &tails, show_hidden));
                slots.push(Json::Object(slot));
            }
            node.insert(codec::ARRAY.into(), Json::Array(slots));
        }
        Value::Raw(raw) => return raw.clone(),
    }
    Json::Object(node)
}

/// Remainders of the paths whose head matches.
fn tails_for<'p>(paths: &[&'p [String]], matches: impl Fn(&str) -> bool) -> Vec<&'p [String]> {
    paths
        .iter()
        .filter(|p| p.first().is_some_and(|seg| matches(seg)))
        .map(|p| &p[1..])
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::codec::decode;

    fn todo() -> UnigraphObject {
        let wire = json!({
            "uid": "0x10",
            "type": {"unigraph.id": "$/schema/todo"},
            "_value": {
                "uid": "0x11",
                "name": {
                    "uid": "0x12",
                    "_value": {
                        "uid": "0x13",
                        "type": {"unigraph.id": "$/schema/note"},
                        "_value": {"uid": "0x14", "text": {"uid": "0x15", "_value.%": "buy milk"}}
                    }
                },
                "done": {"uid": "0x16", "_value.!": false},
                "children": {
                    "uid": "0x17",
                    "_value[": [
                        {"uid": "0x18", "_index": {"_value.#i": 1}, "_key": "b", "_value": {"uid": "0x19", "_value.%": "second"}},
                        {"uid": "0x20", "_index": {"_value.#i": 0}, "_hide": true, "_value": {"uid": "0x21", "_value.%": "first"}}
                    ]
                }
            }
        });
        UnigraphObject::new(decode(&wire).unwrap(), Arc::new(SchemaCatalog::with_builtins()))
    }

    #[test]
    fn get_resolves_through_nested_entities() {
        let obj = todo();
        assert_eq!(obj.get("name.text").unwrap().as_str(), Some("buy milk"));
        assert_eq!(obj.get("done").unwrap().as_primitive(), Some(&json!(false)));

        let name = obj.get("name").unwrap();
        let view = name.as_object().unwrap();
        assert_eq!(view.type_id(), Some("$/schema/note"));
        assert_eq!(view.unpad(), json!({"text": "buy milk"}));
    }

    #[test]
    fn array_segments_match_index_or_key_and_respect_hidden() {
        let obj = todo();
        assert_eq!(obj.get("children.1").unwrap().as_str(), Some("second"));
        assert_eq!(obj.get("children.b").unwrap().as_str(), Some("second"));
        assert!(matches!(obj.get("children.0"), Err(CodecError::PathNotFound(_))));

        let shown = obj.clone().with_show_hidden(true);
        assert_eq!(shown.get("children.0").unwrap().as_str(), Some("first"));
    }

    #[test]
    fn missing_path_reports_prefix() {
        let obj = todo();
        let err = obj.get("name.nope.deeper").unwrap_err();
        assert_eq!(err, CodecError::PathNotFound("name.nope".into()));
    }

    #[test]
    fn set_keeps_kind_and_marks_dirty() {
        let mut obj = todo();
        assert!(!obj.is_dirty());
        obj.set("done", json!(true)).unwrap();
        assert!(obj.is_dirty());
        assert_eq!(obj.get("done").unwrap().as_primitive(), Some(&json!(true)));

        let err = obj.set("done", json!("yes")).unwrap_err();
        assert!(matches!(err, CodecError::KindMismatch { .. }));
        assert!(matches!(
            obj.set("name", json!("x")),
            Err(CodecError::KindMismatch { .. })
        ));
        assert!(matches!(
            obj.set("missing", json!(1)),
            Err(CodecError::PathNotFound(_))
        ));
    }

    #[test]
    fn setting_same_value_is_not_dirty() {
        let mut obj = todo();
        obj.set("done", json!(false)).unwrap();
        assert!(!obj.is_dirty());
    }

    #[test]
    fn clones_do_not_share_state() {
        let original = todo();
        let mut copy = original.clone();
        copy.set("name.text", json!("sell milk")).unwrap();
        assert_eq!(original.get("name.text").unwrap().as_str(), Some("buy milk"));
        assert!(!original.is_dirty());
    }

    #[test]
    fn dirty_patch_addresses_changed_nodes_only() {
        let mut obj = todo();
        obj.set("done", json!(true)).unwrap();
        obj.set("name.text", json!("sell milk")).unwrap();
        obj.set_hidden(true);

        let patch = obj.dirty_patch().unwrap();
        assert_eq!(
            patch,
            json!({
                "_hide": true,
                "_value": {
                    "uid": "0x11",
                    "done": {"uid": "0x16", "_value.!": true},
                    "name": {
                        "uid": "0x12",
                        "_value": {
                            "uid": "0x13",
                            "_value": {"uid": "0x14", "text": {"uid": "0x15", "_value.%": "sell milk"}}
                        }
                    }
                }
            })
        );

        obj.clear_dirty();
        assert_eq!(obj.dirty_patch(), None);
    }

    #[test]
    fn dirty_patch_for_array_element() {
        let mut obj = todo();
        obj.set("children.b", json!("changed")).unwrap();
        let patch = obj.dirty_patch().unwrap();
        assert_eq!(
            patch["_value"]["children"],
            json!({
                "uid": "0x17",
                "_value[": [
                    {"uid": "0x18", "_index": {"_value.#i": 1}, "_value": {"uid": "0x19", "_value.%": "changed"}}
                ]
            })
        );
    }
}
