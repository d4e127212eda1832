//! BLAKE3 fingerprints of schema definitions.
//!
//! Two definitions with the same fingerprint describe the same shape, which
//! lets the catalog tell an idempotent re-registration from an override.

use crate::schema::SchemaDefinition;

/// Compute the BLAKE3 fingerprint of a schema definition.
///
/// Serializes the definition to canonical JSON (object fields are kept in a
/// sorted map) and hashes the bytes. Returns the hex-encoded hash.
pub fn schema_fingerprint(definition: &SchemaDefinition) -> String {
    let json =
        serde_json::to_vec(definition).expect("Schema definition serialization should not fail");
    blake3::hash(&json).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveKind;

    #[test]
    fn field_order_does_not_change_fingerprint() {
        let a = SchemaDefinition::object([
            ("name", SchemaDefinition::primitive(PrimitiveKind::String)),
            ("done", SchemaDefinition::primitive(PrimitiveKind::Boolean)),
        ]);
        let b = SchemaDefinition::object([
            ("done", SchemaDefinition::primitive(PrimitiveKind::Boolean)),
            ("name", SchemaDefinition::primitive(PrimitiveKind::String)),
        ]);
        assert_eq!(schema_fingerprint(&a), schema_fingerprint(&b));
    }

    #[test]
    fn different_shapes_differ() {
        let a = SchemaDefinition::primitive(PrimitiveKind::String);
        let b = SchemaDefinition::primitive(PrimitiveKind::Int);
        assert_ne!(schema_fingerprint(&a), schema_fingerprint(&b));
        assert_eq!(schema_fingerprint(&a).len(), 64);
    }
}
