//! unigraph-cli: Offline tooling for Unigraph wire data and packages.

pub mod commands;
pub mod error;

pub use error::{CliError, Result};
