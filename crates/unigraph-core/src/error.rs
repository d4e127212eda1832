use thiserror::Error;

use crate::codec::CodecError;
use crate::schema::CatalogError;

/// Top-level error type for the Unigraph object-graph model.
#[derive(Error, Debug)]
pub enum UnigraphError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
