//! Error types for the unigraph-cli crate.

use thiserror::Error;

use unigraph_core::codec::CodecError;
use unigraph_core::schema::CatalogError;
use unigraph_core::UnigraphError;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid JSON input: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Core(#[from] UnigraphError),
}

pub type Result<T> = std::result::Result<T, CliError>;
