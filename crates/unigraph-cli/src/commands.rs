//! Offline codec and package commands.
//!
//! Everything here works on local JSON only; nothing talks to a store.

use std::convert::Infallible;
use std::path::Path;

use serde::Serialize;
use serde_json::Value as Json;

use unigraph_core::codec::{self, UnpadOptions};
use unigraph_core::{PackageDescriptor, SchemaCatalog};

use crate::error::{CliError, Result};

/// Read JSON from `path`, or from stdin when `path` is `None` or `-`.
pub fn read_json(path: Option<&Path>) -> Result<Json> {
    let (label, text) = match path {
        Some(p) if p != Path::new("-") => {
            let label = p.display().to_string();
            let text = std::fs::read_to_string(p).map_err(|source| CliError::Read {
                path: label.clone(),
                source,
            })?;
            (label, text)
        }
        _ => {
            let text = std::io::read_to_string(std::io::stdin()).map_err(|source| CliError::Read {
                path: "<stdin>".into(),
                source,
            })?;
            ("<stdin>".to_string(), text)
        }
    };
    tracing::debug!(source = %label, bytes = text.len(), "Read input");
    Ok(serde_json::from_str(&text)?)
}

pub fn read_package(path: &Path) -> Result<PackageDescriptor> {
    Ok(serde_json::from_value(read_json(Some(path))?)?)
}

/// Built-in schemas plus the schemas of every package in `packages`.
pub fn load_catalog(packages: &[PackageDescriptor]) -> SchemaCatalog {
    let catalog = SchemaCatalog::with_builtins();
    for package in packages {
        catalog.register_all(&package.schemas);
    }
    catalog
}

/// Pad a plain value into wire form, optionally directed by a schema.
pub fn pad(catalog: &SchemaCatalog, plain: &Json, schema: Option<&str>) -> Result<Json> {
    let entity = catalog.pad(plain, schema)?;
    Ok(codec::encode(&entity))
}

/// Unpad one wire entity, or a list of them (a query result).
///
/// In a list, entities that fail to decode are skipped with a warning,
/// malformed values inside an entity come out as their raw wire form, and
/// hidden entities are dropped unless `show_hidden` is set.
pub fn unpad(catalog: &SchemaCatalog, wire: &Json, show_hidden: bool) -> Result<Json> {
    let options = UnpadOptions::show_hidden(show_hidden);
    match wire {
        Json::Array(list) => {
            let mut out = Vec::with_capacity(list.len());
            for (position, item) in list.iter().enumerate() {
                match catalog.decode_contained(item) {
                    Ok(decoded) if show_hidden || !decoded.entity.hide => {
                        out.push(codec::unpad(&decoded.entity, options));
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(position, error = %e, "Skipping malformed entity"),
                }
            }
            Ok(Json::Array(out))
        }
        single => {
            let entity = catalog.decode(single)?;
            Ok(codec::unpad(&entity, options))
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct EntityIssue {
    pub position: usize,
    pub error: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CheckReport {
    pub total: usize,
    pub valid: usize,
    pub issues: Vec<EntityIssue>,
}

/// Decode every entity of a batch and report each value that fails.
///
/// An entity is valid when neither it nor anything inside it is malformed.
pub fn check(catalog: &SchemaCatalog, wire: &Json) -> CheckReport {
    let list = match wire {
        Json::Array(list) => list.as_slice(),
        single => std::slice::from_ref(single),
    };
    let mut issues = Vec::new();
    let mut valid = 0;
    for (position, item) in list.iter().enumerate() {
        let errors = match catalog.decode_contained(item) {
            Ok(decoded) => decoded.malformed,
            Err(e) => vec![e],
        };
        if errors.is_empty() {
            valid += 1;
        }
        issues.extend(errors.into_iter().map(|e| EntityIssue {
            position,
            error: e.to_string(),
        }));
    }
    CheckReport {
        total: list.len(),
        valid,
        issues,
    }
}

#[derive(Debug, Serialize, PartialEq)]
pub struct SchemaSummary {
    pub unigraph_id: String,
    pub fingerprint: String,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct PackageReport {
    pub name: String,
    pub version: Option<String>,
    pub schemas: Vec<SchemaSummary>,
    pub default_objects: usize,
    pub invalid_defaults: Vec<EntityIssue>,
}

/// Install a package into a scratch catalog and pad its default data
/// against the installed schemas.
pub async fn inspect_package(descriptor: &PackageDescriptor) -> Result<PackageReport> {
    let catalog = SchemaCatalog::with_builtins();
    let installed = catalog
        .ensure_package(&descriptor.name, descriptor, |_| async {
            Ok::<(), Infallible>(())
        })
        .await?;

    let schemas = descriptor
        .schemas
        .iter()
        .map(|s| SchemaSummary {
            unigraph_id: s.unigraph_id.clone(),
            fingerprint: catalog.fingerprint(&s.unigraph_id).unwrap_or_default(),
        })
        .collect();

    let invalid_defaults = descriptor
        .default_data
        .iter()
        .enumerate()
        .filter_map(|(position, default)| {
            if catalog.lookup(&default.schema).is_none() {
                return Some(EntityIssue {
                    position,
                    error: format!("unknown schema {}", default.schema),
                });
            }
            catalog
                .pad(&default.object, Some(&default.schema))
                .err()
                .map(|e| EntityIssue {
                    position,
                    error: e.to_string(),
                })
        })
        .collect::<Vec<_>>();

    tracing::info!(
        package = %installed.name,
        schemas = installed.schema_count,
        invalid_defaults = invalid_defaults.len(),
        "Package inspected"
    );

    Ok(PackageReport {
        name: installed.name,
        version: installed.version,
        schemas,
        default_objects: descriptor.default_data.len(),
        invalid_defaults,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::json;

    use super::*;

    fn todo_package() -> PackageDescriptor {
        serde_json::from_value(json!({
            "name": "todo",
            "version": "0.1.0",
            "schemas": [{
                "unigraph.id": "$/schema/todo",
                "definition": {
                    "kind": "object",
                    "fields": {
                        "name": {"kind": "primitive", "primitive": "string"},
                        "done": {"kind": "primitive", "primitive": "boolean"}
                    }
                }
            }],
            "default_data": [
                {"schema": "$/schema/todo", "object": {"name": "first", "done": false}},
                {"schema": "$/schema/todo", "object": {"name": 3, "done": false}},
                {"schema": "$/schema/missing", "object": {}}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_read_json_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"name": "x"}}"#).unwrap();
        let value = read_json(Some(file.path())).unwrap();
        assert_eq!(value, json!({"name": "x"}));
    }

    #[test]
    fn test_read_json_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_json(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(matches!(err, CliError::Read { .. }));
    }

    #[test]
    fn test_pad_then_unpad_restores_plain_value() {
        let catalog = load_catalog(&[]);
        let plain = json!({"name": "x", "tags": ["a", "b"], "count": 2});
        let wire = pad(&catalog, &plain, None).unwrap();
        assert_eq!(unpad(&catalog, &wire, false).unwrap(), plain);
    }

    #[test]
    fn test_pad_follows_package_schema() {
        let catalog = load_catalog(&[todo_package()]);
        let wire = pad(&catalog, &json!({"name": "x", "done": true}), Some("$/schema/todo")).unwrap();
        assert_eq!(wire["type"]["unigraph.id"], json!("$/schema/todo"));
        assert_eq!(wire["_value"]["done"]["_value.!"], json!(true));
    }

    #[test]
    fn test_unpad_list_skips_malformed_and_hidden() {
        let catalog = load_catalog(&[]);
        let wire = json!([
            {"uid": "0x1", "_value.%": "a"},
            {"uid": "0x2"},
            {"uid": "0x3", "_hide": true, "_value.%": "c"}
        ]);
        assert_eq!(unpad(&catalog, &wire, false).unwrap(), json!(["a"]));
        assert_eq!(unpad(&catalog, &wire, true).unwrap(), json!(["a", "c"]));
    }

    #[test]
    fn test_check_reports_each_bad_entity() {
        let catalog = load_catalog(&[]);
        let report = check(
            &catalog,
            &json!([{"_value.#i": 1}, {"_value.#i": "one"}, {"uid": "0x9"}]),
        );
        assert_eq!(report.total, 3);
        assert_eq!(report.valid, 1);
        let positions: Vec<_> = report.issues.iter().map(|i| i.position).collect();
        assert_eq!(positions, vec![1, 2]);
    }

    #[test]
    fn test_check_reports_nested_values_and_unpad_keeps_siblings() {
        let catalog = load_catalog(&[]);
        let wire = json!([{
            "uid": "0x1",
            "_value": {"name": {"_value.%": "ok"}, "bad": {"_value.#i": "NaN"}}
        }]);

        let report = check(&catalog, &wire);
        assert_eq!(report.valid, 0);
        assert_eq!(report.issues.len(), 1);
        assert!(report.issues[0].error.contains("bad"));

        let plain = unpad(&catalog, &wire, false).unwrap();
        assert_eq!(plain[0]["name"], json!("ok"));
        assert_eq!(plain[0]["bad"], json!({"_value.#i": "NaN"}));
    }

    #[test]
    fn test_pad_rejects_reserved_field() {
        let catalog = load_catalog(&[]);
        let err = pad(&catalog, &json!({"_hide": true}), None).unwrap_err();
        assert!(matches!(err, CliError::Codec(_)));
    }

    #[tokio::test]
    async fn test_inspect_package() {
        let report = inspect_package(&todo_package()).await.unwrap();
        assert_eq!(report.name, "todo");
        assert_eq!(report.schemas.len(), 1);
        assert_eq!(report.schemas[0].fingerprint.len(), 64);
        assert_eq!(report.default_objects, 3);
        let positions: Vec<_> = report.invalid_defaults.iter().map(|i| i.position).collect();
        assert_eq!(positions, vec![1, 2]);
    }
}
