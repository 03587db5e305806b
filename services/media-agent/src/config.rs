//! Media agent configuration loading. Same raw-then-validated TOML shape as
//! the other control-plane binaries' configs.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct MediaAgentConfig {
    pub schema_version: u32,
    pub self_id: String,
    pub canary_room_id: String,
    pub rooms_prefix: String,
    pub canary_poll_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    self_id: Option<String>,
    canary_room_id: Option<String>,
    rooms_prefix: Option<String>,
    canary_poll_interval_secs: Option<u64>,
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

pub fn load_config_from_path(path: &Path) -> Result<MediaAgentConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<MediaAgentConfig, ConfigError> {
    let path = std::env::var("MEDIA_AGENT_CONFIG").unwrap_or_else(|_| "/etc/audio-room/media-agent.toml".to_owned());
    load_config_from_path(Path::new(&path))
}

pub fn load_config_from_str(toml_str: &str) -> Result<MediaAgentConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw.schema_version.ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!("schema_version must be 1, got {schema_version}")));
    }
    let self_id = raw.self_id.ok_or_else(|| ConfigError::MissingField("self_id".to_owned()))?;
    if self_id.is_empty() {
        return Err(ConfigError::InvalidValue("self_id must not be empty".to_owned()));
    }

    let canary_poll_interval_secs = raw.canary_poll_interval_secs.unwrap_or(10);
    if canary_poll_interval_secs == 0 {
        return Err(ConfigError::InvalidValue("canary_poll_interval_secs must be > 0".to_owned()));
    }

    Ok(MediaAgentConfig {
        schema_version,
        self_id,
        canary_room_id: raw.canary_room_id.unwrap_or_else(|| "canary".to_owned()),
        rooms_prefix: raw.rooms_prefix.unwrap_or_else(|| "rooms/".to_owned()),
        canary_poll_interval_secs,
    })
}
