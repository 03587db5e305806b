//! Fleet manager configuration loading. Same raw-then-validated TOML shape
//! as the signaling gateway's config.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct FleetManagerConfig {
    pub schema_version: u32,
    pub rooms_prefix: String,
    pub media_nodes_prefix: String,
    pub mixers_prefix: String,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    rooms_prefix: Option<String>,
    media_nodes_prefix: Option<String>,
    mixers_prefix: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file '{0}': {1}")]
    Io(String, String),
    #[error("parsing config: {0}")]
    Parse(String),
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

pub fn load_config_from_path(path: &Path) -> Result<FleetManagerConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<FleetManagerConfig, ConfigError> {
    let path = std::env::var("FLEET_MANAGER_CONFIG").unwrap_or_else(|_| "/etc/audio-room/fleet-manager.toml".to_owned());
    load_config_from_path(Path::new(&path))
}

pub fn load_config_from_str(toml_str: &str) -> Result<FleetManagerConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw.schema_version.ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!("schema_version must be 1, got {schema_version}")));
    }

    Ok(FleetManagerConfig {
        schema_version,
        rooms_prefix: raw.rooms_prefix.unwrap_or_else(|| "rooms/".to_owned()),
        media_nodes_prefix: raw.media_nodes_prefix.unwrap_or_else(|| "media_nodes/".to_owned()),
        mixers_prefix: raw.mixers_prefix.unwrap_or_else(|| "mixers/".to_owned()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_schema_version() {
        let err = load_config_from_str("rooms_prefix = \"rooms/\"").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "schema_version"));
    }

    #[test]
    fn defaults_prefixes_when_unset() {
        let cfg = load_config_from_str("schema_version = 1").unwrap();
        assert_eq!(cfg.rooms_prefix, "rooms/");
        assert_eq!(cfg.media_nodes_prefix, "media_nodes/");
        assert_eq!(cfg.mixers_prefix, "mixers/");
    }
}
