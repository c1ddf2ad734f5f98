//! Controller configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/oceancast/controller.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server.bind`
//! - `store.sqlite_path`

use serde::Deserialize;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/oceancast/controller.toml";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level controller configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub schema_version: u32,
    pub server: ServerConfig,
    pub store: StoreConfig,
    /// Run platform start calls on a detached thread.
    pub background_start: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub sqlite_path: String,
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    background_start: Option<bool>,
    server: Option<RawServerConfig>,
    store: Option<RawStoreConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    bind: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStoreConfig {
    sqlite_path: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing or invalid field: {0}")]
    Missing(&'static str),
}

pub fn load_config() -> Result<ControllerConfig, ConfigError> {
    load_config_from(Path::new(DEFAULT_CONFIG_PATH))
}

pub fn load_config_from(path: &Path) -> Result<ControllerConfig, ConfigError> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

fn parse_config(text: &str) -> Result<ControllerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(text)?;
    if raw.schema_version != Some(1) {
        return Err(ConfigError::Missing("schema_version (must be 1)"));
    }
    let bind = raw
        .server
        .and_then(|s| s.bind)
        .filter(|b| !b.is_empty())
        .ok_or(ConfigError::Missing("server.bind"))?;
    let sqlite_path = raw
        .store
        .and_then(|s| s.sqlite_path)
        .filter(|p| !p.is_empty())
        .ok_or(ConfigError::Missing("store.sqlite_path"))?;
    Ok(ControllerConfig {
        schema_version: 1,
        server: ServerConfig { bind },
        store: StoreConfig { sqlite_path },
        background_start: raw.background_start.unwrap_or(true),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let cfg = parse_config(
            r#"
            schema_version = 1
            [server]
            bind = "0.0.0.0:8800"
            [store]
            sqlite_path = "/var/lib/oceancast/controller.db"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server.bind, "0.0.0.0:8800");
        assert!(cfg.background_start);
    }

    #[test]
    fn missing_bind_is_rejected() {
        let err = parse_config(
            r#"
            schema_version = 1
            [store]
            sqlite_path = "/tmp/x.db"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Missing("server.bind")));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let err = parse_config("schema_version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }
}
