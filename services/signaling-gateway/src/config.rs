//! Signaling gateway configuration loading.
//!
//! TOML is the sole config source; `SIGNALING_GATEWAY_CONFIG` overrides the
//! default path. Mirrors the forwarder's raw-then-validated config shape.
//!
//! # Required fields
//! - `schema_version = 1`
//! - `server_id`
//! - `token.key_file` (32 raw bytes, AES-256-GCM key for the session token codec)

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub schema_version: u32,
    pub server_id: String,
    pub bind: String,
    pub room_prefix: String,
    pub token_key: Vec<u8>,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server_id: Option<String>,
    bind: Option<String>,
    room_prefix: Option<String>,
    token: Option<RawTokenConfig>,
    #[serde(default)]
    allowed_origins: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawTokenConfig {
    key_file: Option<String>,
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

pub fn load_config_from_path(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
    load_config_from_str(&toml_str)
}

pub fn load_config() -> Result<GatewayConfig, ConfigError> {
    let path = std::env::var("SIGNALING_GATEWAY_CONFIG").unwrap_or_else(|_| "/etc/audio-room/signaling-gateway.toml".to_owned());
    load_config_from_path(Path::new(&path))
}

pub fn load_config_from_str(toml_str: &str) -> Result<GatewayConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw.schema_version.ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!("schema_version must be 1, got {schema_version}")));
    }

    let server_id = raw.server_id.ok_or_else(|| ConfigError::MissingField("server_id".to_owned()))?;

    let raw_token = raw.token.ok_or_else(|| ConfigError::MissingField("token".to_owned()))?;
    let key_file = raw_token.key_file.ok_or_else(|| ConfigError::MissingField("token.key_file".to_owned()))?;
    let token_key = std::fs::read(&key_file).map_err(|e| ConfigError::Io(key_file.clone(), e.to_string()))?;
    if token_key.len() != 32 {
        return Err(ConfigError::InvalidValue(format!("token.key_file '{key_file}' must contain exactly 32 bytes")));
    }

    Ok(GatewayConfig {
        schema_version,
        server_id,
        bind: raw.bind.unwrap_or_else(|| "0.0.0.0:8088".to_owned()),
        room_prefix: raw.room_prefix.unwrap_or_else(|| "rooms/".to_owned()),
        token_key,
        allowed_origins: raw.allowed_origins,
    })
}
