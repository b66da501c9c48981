//! Configuration management for tunnelgate
//!
//! Configuration is layered: the built-in defaults are serialized to a JSON
//! value, the TOML file is deep-merged over them, and the merged value is
//! deserialized (rejecting unknown keys) and validated once at startup.

mod gateway;
pub mod serde_utils;

pub use gateway::{
    CipherKind, CryptConfig, GatewayConfig, LogConfig, LogLevel, RegistryBackend,
    RegistryConfig, ReplayConfig, BUILTIN_PROTOCOLS,
};

use crate::error::ConfigError;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnelgate")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load gateway configuration from a TOML file layered over the defaults
pub fn load_config(path: &Path) -> Result<GatewayConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    tracing::debug!("Loading configuration from {:?}", path);
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    parse_config(&content)
}

/// Parse gateway configuration from TOML text layered over the defaults
pub fn parse_config(content: &str) -> Result<GatewayConfig, ConfigError> {
    let overrides: toml::Value = toml::from_str(content)?;
    let overrides = serde_json::to_value(overrides)?;

    let mut layered = serde_json::to_value(GatewayConfig::default())?;
    deep_merge(&mut layered, overrides);

    let config: GatewayConfig = serde_json::from_value(layered)?;
    config.validate()?;
    Ok(config)
}

/// Merge `overlay` into `base`; objects merge per key, anything else replaces
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}
