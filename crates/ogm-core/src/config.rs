//! Configuration for the object-graph mapper.
//!
//! Configuration is loaded from (in priority order):
//! 1. Environment variables (`OGM__` prefix, `__` separating sections)
//! 2. Config file (`<prefix>.toml`, optional)
//! 3. Defaults

use serde::{Deserialize, Serialize};

use crate::error::OgmError;

/// Top-level configuration, threaded explicitly into drivers and sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OgmConfig {
    #[serde(default)]
    pub neo4j: Neo4jConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Connection settings for the Neo4j transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neo4jConfig {
    #[serde(default = "default_uri")]
    pub uri: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
}

/// Session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Depth used by `save` when none is given; `-1` walks the whole graph.
    #[serde(default = "default_save_depth")]
    pub default_save_depth: i32,

    /// Depth used by `load` when none is given.
    #[serde(default = "default_load_depth")]
    pub default_load_depth: i32,

    /// Deliver persistence events to registered listeners.
    #[serde(default = "default_true")]
    pub events_enabled: bool,
}

fn default_uri() -> String {
    "bolt://localhost:7687".to_string()
}

fn default_user() -> String {
    "neo4j".to_string()
}

fn default_password() -> String {
    "neo4j".to_string()
}

fn default_max_connections() -> u32 {
    16
}

fn default_fetch_size() -> usize {
    256
}

fn default_save_depth() -> i32 {
    -1
}

fn default_load_depth() -> i32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            user: default_user(),
            password: default_password(),
            max_connections: default_max_connections(),
            fetch_size: default_fetch_size(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_save_depth: default_save_depth(),
            default_load_depth: default_load_depth(),
            events_enabled: default_true(),
        }
    }
}

impl OgmConfig {
    /// Load configuration from `<file_prefix>.toml` (if present) overlaid
    /// with `OGM__SECTION__KEY` environment variables.
    pub fn load(file_prefix: &str) -> Result<Self, OgmError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(file_prefix).required(false))
            .add_source(
                config::Environment::with_prefix("OGM")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| OgmError::Config(e.to_string()))?;

        let loaded: Self = settings
            .try_deserialize()
            .map_err(|e| OgmError::Config(e.to_string()))?;
        tracing::debug!(uri = %loaded.neo4j.uri, "Loaded OGM configuration");
        Ok(loaded)
    }

    /// Parse configuration from TOML text, falling back to defaults for
    /// anything it leaves out.
    pub fn from_toml(text: &str) -> Result<Self, OgmError> {
        config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| OgmError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OgmConfig::default();
        assert_eq!(config.neo4j.uri, "bolt://localhost:7687");
        assert_eq!(config.neo4j.max_connections, 16);
        assert_eq!(config.session.default_save_depth, -1);
        assert_eq!(config.session.default_load_depth, 1);
        assert!(config.session.events_enabled);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = OgmConfig::load("this-config-file-does-not-exist").unwrap();
        assert_eq!(config.neo4j.fetch_size, 256);
    }

    #[test]
    fn test_partial_toml() {
        let config = OgmConfig::from_toml(
            r#"
            [neo4j]
            uri = "bolt://graph:7687"

            [session]
            default_load_depth = 2
            events_enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.neo4j.uri, "bolt://graph:7687");
        assert_eq!(config.neo4j.user, "neo4j");
        assert_eq!(config.session.default_load_depth, 2);
        assert_eq!(config.session.default_save_depth, -1);
        assert!(!config.session.events_enabled);
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = OgmConfig::from_toml("[session]\ndefault_load_depth = \"deep\"").unwrap_err();
        assert!(matches!(err, OgmError::Config(_)));
    }
}
