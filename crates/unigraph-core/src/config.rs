//! Client configuration.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`UNIGRAPH__CLIENT__` prefix)
//! 2. Config file (`unigraph.toml`, `[client]` section)
//! 3. Defaults

use std::time::Duration;

use serde::Deserialize;

use crate::error::UnigraphError;

/// Settings for a Unigraph client context.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Bound on one-shot requests (queries, mutations, executables), in
    /// milliseconds. Subscriptions never time out.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Default for `show_hidden` when a subscription does not say.
    #[serde(default)]
    pub show_hidden: bool,
}

impl ClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Load from `{file_prefix}.toml` (optional) and the environment.
    ///
    /// A missing `[client]` section yields the defaults.
    pub fn load(file_prefix: &str) -> Result<Self, UnigraphError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("UNIGRAPH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| UnigraphError::Config(e.to_string()))?;

        match cfg.get::<ClientConfig>("client") {
            Ok(c) => Ok(c),
            Err(config::ConfigError::NotFound(_)) => Ok(ClientConfig::default()),
            Err(e) => Err(UnigraphError::Config(e.to_string())),
        }
    }
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            show_hidden: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(!config.show_hidden);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = ClientConfig::load("definitely-not-a-unigraph-config").unwrap();
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_partial_section_fills_defaults() {
        let config: ClientConfig =
            serde_json::from_value(serde_json::json!({"request_timeout_ms": 500})).unwrap();
        assert_eq!(config.request_timeout(), Duration::from_millis(500));
        assert!(!config.show_hidden);
    }
}
