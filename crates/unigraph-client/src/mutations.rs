//! Mutation engine: creating and patching objects in the store.
//!
//! New objects are padded, every node that has no uid yet gets a local
//! placeholder, and the store's acknowledgment maps each placeholder to a
//! confirmed uid. Those mappings are kept so callers can go on using a
//! placeholder after its object was created.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::json;

use unigraph_core::codec::{self, CodecError};
use unigraph_core::protocol::{CreateAck, RequestEvent};
use unigraph_core::{Entity, SubscriptionId, Uid, UnigraphObject, Value};

use crate::client::{ClientError, Result, UnigraphClient};

/// Schema used when a new object is created through `update_object`
/// without a type of its own.
const FALLBACK_SCHEMA: &str = "$/composer/Object";

/// Placeholder → store-assigned uid.
#[derive(Debug, Default)]
pub struct IdentifierMap {
    confirmed: RwLock<HashMap<Uid, Uid>>,
}

impl IdentifierMap {
    pub fn resolve(&self, placeholder: &Uid) -> Option<Uid> {
        self.confirmed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(placeholder)
            .cloned()
    }

    pub fn record(&self, placeholder: Uid, confirmed: Uid) {
        self.confirmed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(placeholder, confirmed);
    }

    pub fn len(&self) -> usize {
        self.confirmed.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What to create: a plain value to be padded, or an already padded entity.
#[derive(Debug, Clone)]
pub enum ObjectInput {
    Plain(serde_json::Value),
    Padded(Entity),
}

impl From<serde_json::Value> for ObjectInput {
    fn from(v: serde_json::Value) -> Self {
        Self::Plain(v)
    }
}

impl From<Entity> for ObjectInput {
    fn from(e: Entity) -> Self {
        Self::Padded(e)
    }
}

impl From<UnigraphObject> for ObjectInput {
    fn from(o: UnigraphObject) -> Self {
        Self::Padded(o.into_entity())
    }
}

/// Body of an update.
#[derive(Debug, Clone)]
pub enum Patch {
    /// Plain value, padded by shape before sending.
    Plain(serde_json::Value),
    /// Wire-form payload, sent as is.
    Padded(serde_json::Value),
}

impl Patch {
    pub fn plain(v: serde_json::Value) -> Self {
        Self::Plain(v)
    }

    pub fn padded(v: serde_json::Value) -> Self {
        Self::Padded(v)
    }

    fn into_wire(self) -> std::result::Result<serde_json::Value, CodecError> {
        match self {
            Self::Plain(v) => Ok(codec::encode(&codec::pad(&v)?)),
            Self::Padded(v) => Ok(v),
        }
    }
}

/// Payload rewrite applied just before an update is sent.
pub type Transform = Box<dyn FnOnce(serde_json::Value) -> serde_json::Value + Send>;

/// Options of [`UnigraphClient::update_object`].
#[derive(Default)]
pub struct UpdateOptions {
    /// Create the object instead of patching an existing one.
    pub is_new: bool,
    /// Combine the patch with the stored value instead of replacing
    /// matched substructures.
    pub merge: bool,
    /// Subscription the caller considers the origin of the change.
    pub subscription_id: Option<SubscriptionId>,
    pub transform: Option<Transform>,
    /// Suppress the store's default change notification.
    pub event_only: bool,
}

impl UpdateOptions {
    pub fn is_new(mut self, is_new: bool) -> Self {
        self.is_new = is_new;
        self
    }

    pub fn merge(mut self, merge: bool) -> Self {
        self.merge = merge;
        self
    }

    pub fn subscription(mut self, id: SubscriptionId) -> Self {
        self.subscription_id = Some(id);
        self
    }

    pub fn transform(
        mut self,
        f: impl FnOnce(serde_json::Value) -> serde_json::Value + Send + 'static,
    ) -> Self {
        self.transform = Some(Box::new(f));
        self
    }

    pub fn event_only(mut self, event_only: bool) -> Self {
        self.event_only = event_only;
        self
    }
}

impl std::fmt::Debug for UpdateOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateOptions")
            .field("is_new", &self.is_new)
            .field("merge", &self.merge)
            .field("subscription_id", &self.subscription_id)
            .field("transform", &self.transform.is_some())
            .field("event_only", &self.event_only)
            .finish()
    }
}

/// Give every node without a uid a fresh placeholder. Returns the root's uid.
fn assign_placeholders(entity: &mut Entity) -> Uid {
    entity.walk_mut(&mut |node: &mut Entity| {
        if node.uid.is_none() {
            node.uid = Some(Uid::placeholder());
        }
        match &mut node.value {
            Value::Object(object) if object.uid.is_none() => {
                object.uid = Some(Uid::placeholder());
            }
            Value::Array(items) => {
                for item in items.iter_mut().filter(|i| i.uid.is_none()) {
                    item.uid = Some(Uid::placeholder());
                }
            }
            _ => {}
        }
    });
    // walk_mut visits the root first, so it has a uid by now.
    entity.uid.clone().unwrap_or_else(Uid::placeholder)
}

impl UnigraphClient {
    /// Create an object under `schema_id` and return its confirmed uid.
    pub async fn add_object(&self, input: impl Into<ObjectInput>, schema_id: &str) -> Result<Uid> {
        let mut entity = match input.into() {
            ObjectInput::Plain(plain) => self.inner.catalog.pad(&plain, Some(schema_id))?,
            ObjectInput::Padded(entity) if entity.type_ref.is_some() => entity,
            ObjectInput::Padded(entity) => entity.with_type(schema_id),
        };
        let root = assign_placeholders(&mut entity);
        self.create(&entity, schema_id, root).await
    }

    async fn create(&self, entity: &Entity, schema_id: &str, root: Uid) -> Result<Uid> {
        let result = self
            .inner
            .dispatcher
            .request(RequestEvent::CreateObject {
                object: codec::encode(entity),
                schema: schema_id.to_string(),
            })
            .await?;

        let ack: CreateAck = serde_json::from_value(result)
            .map_err(|e| ClientError::InvalidResponse(format!("create acknowledgment: {e}")))?;
        for (placeholder, confirmed) in &ack.uids {
            self.inner
                .identifiers
                .record(Uid::new(placeholder.as_str()), Uid::new(confirmed.as_str()));
        }

        let confirmed = match ack.uids.get(root.as_str()) {
            Some(uid) => Uid::new(uid.as_str()),
            None if !root.is_placeholder() => root,
            None => {
                return Err(ClientError::InvalidResponse(format!(
                    "no uid assigned to {root}"
                )))
            }
        };
        tracing::info!(
            uid = %confirmed,
            schema = %schema_id,
            nodes = ack.uids.len(),
            "Object created"
        );
        Ok(confirmed)
    }

    /// Confirmed uid for `uid`, following placeholder mappings.
    pub fn resolve_uid(&self, uid: &Uid) -> Uid {
        if uid.is_placeholder() {
            if let Some(confirmed) = self.inner.identifiers.resolve(uid) {
                return confirmed;
            }
        }
        uid.clone()
    }

    pub fn identifiers(&self) -> &IdentifierMap {
        &self.inner.identifiers
    }

    /// Patch the object `uid`, or create it when `options.is_new` is set.
    pub async fn update_object(&self, uid: &Uid, patch: Patch, options: UpdateOptions) -> Result<()> {
        let target = self.resolve_uid(uid);
        if target.is_placeholder() && !options.is_new {
            return Err(ClientError::UnknownEntity(target.to_string()));
        }

        let mut payload = patch.into_wire()?;
        if let Some(transform) = options.transform {
            payload = transform(payload);
        }

        if options.is_new {
            let mut entity = self.inner.catalog.decode(&payload)?;
            entity.uid = Some(target.clone());
            let schema = entity
                .type_id()
                .unwrap_or(FALLBACK_SCHEMA)
                .to_string();
            assign_placeholders(&mut entity);
            self.create(&entity, &schema, target).await?;
            return Ok(());
        }

        tracing::debug!(
            uid = %target,
            merge = options.merge,
            event_only = options.event_only,
            "Updating object"
        );
        self.inner
            .dispatcher
            .request(RequestEvent::UpdateObject {
                uid: target.to_string(),
                patch: payload,
                merge: options.merge,
                subscription_id: options.subscription_id,
                event_only: options.event_only,
            })
            .await?;
        Ok(())
    }

    /// Soft-delete: hide the object, keeping its data.
    pub async fn delete_object(&self, uid: &Uid) -> Result<()> {
        self.update_object(
            uid,
            Patch::padded(json!({ "_hide": true })),
            UpdateOptions::default().merge(true),
        )
        .await
    }

    /// Send the object's local edits and clear its dirty marks on success.
    ///
    /// The edits are a partial payload and are always merged into the stored
    /// object; `options.merge` is overridden. Returns `false` when there was
    /// nothing to send.
    pub async fn save_object(&self, object: &mut UnigraphObject, options: UpdateOptions) -> Result<bool> {
        let Some(patch) = object.dirty_patch() else {
            return Ok(false);
        };
        let uid = object
            .uid()
            .cloned()
            .ok_or_else(|| ClientError::UnknownEntity("object has no uid".into()))?;
        self.update_object(&uid, Patch::padded(patch), options.merge(true))
            .await?;
        object.clear_dirty();
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_cover_every_new_node() {
        let mut entity = codec::pad(&json!({"tags": ["a", "b"], "name": "x"})).unwrap();
        let root = assign_placeholders(&mut entity);
        assert!(root.is_placeholder());

        let wire = codec::encode(&entity);
        let tags = &wire["_value"]["tags"]["_value["];
        assert_eq!(tags.as_array().unwrap().len(), 2);
        for item in tags.as_array().unwrap() {
            assert!(item["uid"].as_str().unwrap().starts_with("_:"));
            assert!(item["_value"]["uid"].as_str().unwrap().starts_with("_:"));
        }
        assert!(wire["_value"]["uid"].as_str().unwrap().starts_with("_:"));
    }

    #[test]
    fn existing_uids_are_kept() {
        let mut entity = codec::pad(&json!("x")).unwrap().with_uid(Uid::new("0x10"));
        assert_eq!(assign_placeholders(&mut entity), Uid::new("0x10"));
    }

    #[test]
    fn identifier_map_resolves_recorded_placeholders() {
        let map = IdentifierMap::default();
        assert!(map.is_empty());
        map.record(Uid::new("_:a"), Uid::new("0x1"));
        assert_eq!(map.resolve(&Uid::new("_:a")), Some(Uid::new("0x1")));
        assert_eq!(map.resolve(&Uid::new("_:b")), None);
    }

    #[test]
    fn plain_patches_are_padded() {
        let wire = Patch::plain(json!({"done": true})).into_wire().unwrap();
        assert_eq!(wire, json!({"_value": {"done": {"_value.!": true}}}));
    }

    #[test]
    fn plain_patch_with_reserved_key_is_rejected() {
        let err = Patch::plain(json!({"uid": "0x1"})).into_wire().unwrap_err();
        assert!(matches!(err, CodecError::ReservedField { .. }));
    }
}
