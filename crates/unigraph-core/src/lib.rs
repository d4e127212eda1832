//! unigraph-core: Object-graph model for Unigraph clients.
//!
//! This crate provides the pieces that need no I/O:
//! - Entity / Value types for schema-typed graph nodes
//! - The value codec (wire form, padding and unpadding)
//! - The schema catalog and package installation bookkeeping
//! - The typed object wrapper with path-based access and dirty tracking
//! - Wire protocol messages and client configuration

pub mod codec;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod object;
pub mod protocol;
pub mod schema;
pub mod types;

pub use codec::{pad, unpad, CodecError, UnpadOptions};
pub use config::ClientConfig;
pub use error::UnigraphError;
pub use object::{Field, ObjectView, UnigraphObject};
pub use schema::{PackageDescriptor, Schema, SchemaCatalog, SchemaDefinition};
pub use types::{ArrayItem, Entity, ObjectValue, Primitive, PrimitiveKind, SubscriptionId, Uid, Value};
