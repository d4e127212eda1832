//! Schema catalog: global type identifier → schema metadata.
//!
//! The catalog is shared and read-mostly. Writes (`register`,
//! `ensure_package`) are serialized against each other; reads never wait on
//! a remote install and may observe schema knowledge slightly behind it.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::codec::{self, CodecError, Decoded, SchemaSource};
use crate::fingerprint::schema_fingerprint;
use crate::types::{Entity, PrimitiveKind};

/// Errors from catalog writes.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    #[error("Failed to install package {package}: {message}")]
    Install { package: String, message: String },
}

// ── Schema model ──────────────────────────────────────────────────

/// Shape description of the values a schema admits.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaDefinition {
    Primitive {
        primitive: PrimitiveKind,
    },
    Array {
        element: Box<SchemaDefinition>,
    },
    Object {
        fields: BTreeMap<String, SchemaDefinition>,
    },
    /// A nested entity typed by another schema.
    Reference {
        unigraph_id: String,
    },
    /// Shape decided by inspecting the value.
    #[default]
    Any,
}

impl SchemaDefinition {
    pub fn primitive(kind: PrimitiveKind) -> Self {
        Self::Primitive { primitive: kind }
    }

    pub fn array(element: SchemaDefinition) -> Self {
        Self::Array {
            element: Box::new(element),
        }
    }

    pub fn object<'a>(fields: impl IntoIterator<Item = (&'a str, SchemaDefinition)>) -> Self {
        Self::Object {
            fields: fields
                .into_iter()
                .map(|(name, def)| (name.to_string(), def))
                .collect(),
        }
    }

    pub fn reference(unigraph_id: impl Into<String>) -> Self {
        Self::Reference {
            unigraph_id: unigraph_id.into(),
        }
    }
}

/// A schema as stored in the graph. Referenced from entities by id, never
/// embedded in them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    #[serde(rename = "unigraph.id")]
    pub unigraph_id: String,
    #[serde(default)]
    pub definition: SchemaDefinition,
}

impl Schema {
    pub fn new(unigraph_id: impl Into<String>, definition: SchemaDefinition) -> Self {
        Self {
            unigraph_id: unigraph_id.into(),
            definition,
        }
    }
}

/// An object installed alongside a package's schemas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DefaultObject {
    pub schema: String,
    pub object: serde_json::Value,
}

/// A named bundle of schemas and default data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PackageDescriptor {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub schemas: Vec<Schema>,
    #[serde(default)]
    pub default_data: Vec<DefaultObject>,
}

/// Record of a completed package installation.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InstalledPackage {
    pub name: String,
    pub version: Option<String>,
    pub schema_count: usize,
    pub installed_at: DateTime<Utc>,
}

/// Result of [`SchemaCatalog::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Inserted,
    /// Same id, same definition.
    Unchanged,
    /// Same id, different definition; the new one wins.
    Overridden,
}

struct CatalogEntry {
    schema: Schema,
    fingerprint: String,
}

// ── Catalog ───────────────────────────────────────────────────────

/// Shared mapping from `unigraph.id` to schema.
pub struct SchemaCatalog {
    schemas: RwLock<HashMap<String, CatalogEntry>>,
    packages: Mutex<HashMap<String, Arc<OnceCell<InstalledPackage>>>>,
    install_lock: tokio::sync::Mutex<()>,
}

impl Default for SchemaCatalog {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl SchemaCatalog {
    /// An empty catalog.
    pub fn empty() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
            packages: Mutex::new(HashMap::new()),
            install_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// A catalog seeded with the primitive and composer schemas every store
    /// ships with.
    pub fn with_builtins() -> Self {
        let catalog = Self::empty();
        catalog.register_all(&builtin_schemas());
        catalog
    }

    /// Register a schema. Re-registering an id with a different definition
    /// replaces it and is logged as an override.
    pub fn register(&self, schema: Schema) -> RegisterOutcome {
        let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());
        insert_entry(&mut schemas, schema)
    }

    /// Register several schemas under one write, so readers never observe a
    /// partially applied bundle.
    pub fn register_all(&self, bundle: &[Schema]) {
        let mut schemas = self.schemas.write().unwrap_or_else(|e| e.into_inner());
        for schema in bundle {
            insert_entry(&mut schemas, schema.clone());
        }
    }

    pub fn lookup(&self, unigraph_id: &str) -> Option<Schema> {
        let schemas = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        schemas.get(unigraph_id).map(|entry| entry.schema.clone())
    }

    pub fn fingerprint(&self, unigraph_id: &str) -> Option<String> {
        let schemas = self.schemas.read().unwrap_or_else(|e| e.into_inner());
        schemas.get(unigraph_id).map(|entry| entry.fingerprint.clone())
    }

    pub fn len(&self) -> usize {
        self.schemas.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Install a package exactly once per name.
    ///
    /// `install` performs the remote side of the installation (schemas and
    /// default data). Concurrent calls for the same name wait on the first
    /// one's in-flight installation instead of starting another. A failed
    /// installation is not cached; a later call tries again.
    pub async fn ensure_package<F, Fut, E>(
        &self,
        name: &str,
        descriptor: &PackageDescriptor,
        install: F,
    ) -> Result<InstalledPackage, CatalogError>
    where
        F: FnOnce(PackageDescriptor) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: std::fmt::Display,
    {
        let cell = {
            let mut packages = self.packages.lock().unwrap_or_else(|e| e.into_inner());
            packages
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let record = cell
            .get_or_try_init(|| async {
                let _guard = self.install_lock.lock().await;
                tracing::info!(
                    package = %name,
                    schemas = descriptor.schemas.len(),
                    default_objects = descriptor.default_data.len(),
                    "Installing package"
                );

                install(descriptor.clone())
                    .await
                    .map_err(|e| CatalogError::Install {
                        package: name.to_string(),
                        message: e.to_string(),
                    })?;
                self.register_all(&descriptor.schemas);

                Ok::<_, CatalogError>(InstalledPackage {
                    name: name.to_string(),
                    version: descriptor.version.clone(),
                    schema_count: descriptor.schemas.len(),
                    installed_at: Utc::now(),
                })
            })
            .await?;

        Ok(record.clone())
    }

    /// Packages installed so far.
    pub fn installed_packages(&self) -> Vec<InstalledPackage> {
        let packages = self.packages.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = packages.values().filter_map(|c| c.get().cloned()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Pad a plain value, directed by `schema_id` when given.
    ///
    /// The hint is resolved here, at the call boundary. An unknown schema
    /// falls back to shape inspection and keeps the type link.
    pub fn pad(
        &self,
        plain: &serde_json::Value,
        schema_id: Option<&str>,
    ) -> Result<Entity, CodecError> {
        let Some(id) = schema_id else {
            return codec::pad(plain);
        };
        let entity = match self.definition(id) {
            Some(def) => codec::pad_as(plain, &def, self)?,
            None => {
                tracing::warn!(unigraph_id = %id, "Padding against unknown schema by shape");
                codec::pad(plain)?
            }
        };
        Ok(entity.with_type(id))
    }

    /// Decode a wire entity, tolerating schemas this catalog has not loaded.
    pub fn decode(&self, wire: &serde_json::Value) -> Result<Entity, CodecError> {
        codec::decode_with(wire, self)
    }

    /// Decode a wire entity, keeping malformed fields and elements raw.
    pub fn decode_contained(&self, wire: &serde_json::Value) -> Result<Decoded, CodecError> {
        codec::decode_contained(wire, self)
    }
}

impl SchemaSource for SchemaCatalog {
    fn definition(&self, unigraph_id: &str) -> Option<SchemaDefinition> {
        self.lookup(unigraph_id).map(|s| s.definition)
    }
}

fn insert_entry(schemas: &mut HashMap<String, CatalogEntry>, schema: Schema) -> RegisterOutcome {
    let fingerprint = schema_fingerprint(&schema.definition);
    let outcome = match schemas.get(&schema.unigraph_id) {
        None => RegisterOutcome::Inserted,
        Some(existing) if existing.fingerprint == fingerprint => RegisterOutcome::Unchanged,
        Some(existing) => {
            tracing::warn!(
                unigraph_id = %schema.unigraph_id,
                previous = %existing.fingerprint,
                current = %fingerprint,
                "Schema override"
            );
            RegisterOutcome::Overridden
        }
    };
    schemas.insert(
        schema.unigraph_id.clone(),
        CatalogEntry {
            schema,
            fingerprint,
        },
    );
    outcome
}

/// Schemas every store carries.
pub fn builtin_schemas() -> Vec<Schema> {
    let mut out: Vec<Schema> = [
        ("$/primitive/number", PrimitiveKind::Number),
        ("$/primitive/boolean", PrimitiveKind::Boolean),
        ("$/primitive/string", PrimitiveKind::String),
        ("$/primitive/datetime", PrimitiveKind::Datetime),
        ("$/primitive/null", PrimitiveKind::Null),
        ("$/primitive/undefined", PrimitiveKind::Undefined),
    ]
    .into_iter()
    .map(|(id, kind)| Schema::new(id, SchemaDefinition::primitive(kind)))
    .collect();

    out.push(Schema::new(
        "$/composer/Array",
        SchemaDefinition::array(SchemaDefinition::Any),
    ));
    out.push(Schema::new(
        "$/composer/Object",
        SchemaDefinition::Object {
            fields: BTreeMap::new(),
        },
    ));
    out.push(Schema::new("$/unigraph", SchemaDefinition::Any));
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::codec::UnpadOptions;
    use crate::types::{Primitive, Value};

    fn todo_package() -> PackageDescriptor {
        PackageDescriptor {
            name: "unigraph.todo".into(),
            version: Some("0.1.0".into()),
            schemas: vec![Schema::new(
                "$/schema/todo",
                SchemaDefinition::object([
                    ("name", SchemaDefinition::primitive(PrimitiveKind::String)),
                    ("done", SchemaDefinition::primitive(PrimitiveKind::Boolean)),
                ]),
            )],
            default_data: vec![],
        }
    }

    #[test]
    fn builtins_are_seeded() {
        let catalog = SchemaCatalog::with_builtins();
        assert!(catalog.lookup("$/primitive/string").is_some());
        assert!(catalog.lookup("$/composer/Array").is_some());
        assert!(catalog.lookup("$/schema/todo").is_none());
    }

    #[test]
    fn register_is_idempotent_and_overrides_last_write_wins() {
        let catalog = SchemaCatalog::empty();
        let first = Schema::new("$/schema/a", SchemaDefinition::primitive(PrimitiveKind::String));
        let second = Schema::new("$/schema/a", SchemaDefinition::primitive(PrimitiveKind::Int));

        assert_eq!(catalog.register(first.clone()), RegisterOutcome::Inserted);
        assert_eq!(catalog.register(first), RegisterOutcome::Unchanged);
        assert_eq!(catalog.register(second.clone()), RegisterOutcome::Overridden);
        assert_eq!(catalog.lookup("$/schema/a"), Some(second));
    }

    #[test]
    fn schema_parses_without_definition() {
        let schema: Schema = serde_json::from_value(json!({"unigraph.id": "$/unigraph"})).unwrap();
        assert_eq!(schema.definition, SchemaDefinition::Any);
    }

    #[test]
    fn pad_with_primitive_hint() {
        let catalog = SchemaCatalog::with_builtins();
        let entity = catalog.pad(&json!("hello"), Some("$/primitive/string")).unwrap();
        assert_eq!(
            entity.value,
            Value::Primitive(Primitive::new(PrimitiveKind::String, json!("hello")))
        );
        assert_eq!(codec::unpad(&entity, UnpadOptions::default()), json!("hello"));
    }

    #[test]
    fn pad_under_registered_schema_sets_root_type() {
        let catalog = SchemaCatalog::with_builtins();
        catalog.register_all(&todo_package().schemas);
        let entity = catalog
            .pad(&json!({"name": "x", "done": false}), Some("$/schema/todo"))
            .unwrap();
        assert_eq!(entity.type_id(), Some("$/schema/todo"));
        assert!(catalog
            .pad(&json!({"name": 3}), Some("$/schema/todo"))
            .is_err());
    }

    #[test]
    fn pad_under_unknown_schema_falls_back_to_shape() {
        let catalog = SchemaCatalog::with_builtins();
        let entity = catalog.pad(&json!({"a": 1}), Some("$/schema/missing")).unwrap();
        assert_eq!(entity.type_id(), Some("$/schema/missing"));
        assert_eq!(codec::unpad(&entity, UnpadOptions::default()), json!({"a": 1}));
    }

    #[tokio::test]
    async fn concurrent_ensure_package_installs_once() {
        let catalog = Arc::new(SchemaCatalog::with_builtins());
        let installs = Arc::new(AtomicUsize::new(0));
        let desc = todo_package();

        let run = |catalog: Arc<SchemaCatalog>, installs: Arc<AtomicUsize>, desc: PackageDescriptor| async move {
            catalog
                .ensure_package("p", &desc, |_| async {
                    installs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, String>(())
                })
                .await
        };

        let (a, b) = tokio::join!(
            run(catalog.clone(), installs.clone(), desc.clone()),
            run(catalog.clone(), installs.clone(), desc.clone()),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(installs.load(Ordering::SeqCst), 1);
        assert!(catalog.lookup("$/schema/todo").is_some());
        assert_eq!(catalog.installed_packages().len(), 1);
    }

    #[tokio::test]
    async fn failed_install_is_retried_later() {
        let catalog = SchemaCatalog::with_builtins();
        let desc = todo_package();

        let err = catalog
            .ensure_package("p", &desc, |_| async { Err::<(), _>("store unavailable") })
            .await
            .unwrap_err();
        assert!(matches!(err, CatalogError::Install { .. }));
        assert!(catalog.lookup("$/schema/todo").is_none());

        let ok = catalog
            .ensure_package("p", &desc, |_| async { Ok::<_, String>(()) })
            .await
            .unwrap();
        assert_eq!(ok.schema_count, 1);
    }
}
