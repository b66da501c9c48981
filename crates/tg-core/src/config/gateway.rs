//! Gateway configuration

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;
use crate::types::BackendAddr;

/// Connection types with built-in default settings
pub const BUILTIN_PROTOCOLS: [&str; 5] = ["rdp", "vnc", "ssh", "telnet", "join"];

/// Configuration for the gateway daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Address the admission endpoint listens on
    pub listen_address: String,

    /// Backend daemon used when a token does not route elsewhere
    pub backend: BackendAddr,

    /// Token encryption settings
    pub crypt: CryptConfig,

    /// Close a tunnel after this long without backend traffic
    #[serde(with = "duration_millis")]
    pub max_inactivity_time: Duration,

    /// Upper bound on resolving and connecting to a backend daemon
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Logging settings
    pub log: LogConfig,

    /// Used-token retention settings
    pub replay: ReplayConfig,

    /// Session registry settings
    pub registry: RegistryConfig,

    /// Per connection type default settings sent to the backend daemon
    pub connection_default_settings: BTreeMap<String, Map<String, Value>>,

    /// Per connection type settings a client may supply outside the token
    pub allowed_unencrypted_settings: BTreeMap<String, Vec<String>>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:8080".to_string(),
            backend: BackendAddr::default(),
            crypt: CryptConfig::default(),
            max_inactivity_time: Duration::from_millis(10_000),
            connect_timeout: Duration::from_secs(10),
            log: LogConfig::default(),
            replay: ReplayConfig::default(),
            registry: RegistryConfig::default(),
            connection_default_settings: default_connection_settings(),
            allowed_unencrypted_settings: default_allowed_settings(),
        }
    }
}

impl GatewayConfig {
    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        SocketAddr::from_str(&self.listen_address).map_err(|e| {
            ConfigError::Invalid(format!("listen_address {:?}: {}", self.listen_address, e))
        })?;

        if self.backend.host.is_empty() || self.backend.port == 0 {
            return Err(ConfigError::Invalid(format!(
                "default backend {} is not a usable address",
                self.backend
            )));
        }

        if let Some(key) = &self.crypt.key {
            let expected = self.crypt.cipher.key_len();
            if key.len() != expected {
                return Err(ConfigError::Invalid(format!(
                    "crypt.key must be {} bytes for {}, got {}",
                    expected,
                    self.crypt.cipher,
                    key.len()
                )));
            }
        }

        let durations = [
            ("max_inactivity_time", self.max_inactivity_time),
            ("connect_timeout", self.connect_timeout),
            ("replay.retention", self.replay.retention),
            ("replay.sweep_interval", self.replay.sweep_interval),
            ("registry.op_timeout", self.registry.op_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| d.is_zero()) {
            return Err(ConfigError::Invalid(format!("{} must be non-zero", name)));
        }

        if self.registry.backend == RegistryBackend::Redis && self.registry.redis_url.is_empty() {
            return Err(ConfigError::Invalid(
                "registry.redis_url is required for the redis backend".to_string(),
            ));
        }

        for protocol in self.allowed_unencrypted_settings.keys() {
            if !self.connection_default_settings.contains_key(protocol) {
                return Err(ConfigError::Invalid(format!(
                    "allowed_unencrypted_settings.{} has no matching connection_default_settings entry",
                    protocol
                )));
            }
        }

        Ok(())
    }

    /// Default settings for a connection type
    pub fn default_settings_for(&self, protocol: &str) -> Map<String, Value> {
        self.connection_default_settings
            .get(protocol)
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a client may supply `setting` unencrypted for `protocol`
    pub fn is_unencrypted_allowed(&self, protocol: &str, setting: &str) -> bool {
        self.allowed_unencrypted_settings
            .get(protocol)
            .is_some_and(|names| names.iter().any(|name| name == setting))
    }
}

/// Token encryption settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CryptConfig {
    /// Symmetric cipher used to seal tokens
    pub cipher: CipherKind,
    /// Raw key bytes (as UTF-8 text); tokens cannot be decrypted without it
    pub key: Option<String>,
}

/// Supported token ciphers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum CipherKind {
    Aes128Cbc,
    Aes192Cbc,
    #[default]
    Aes256Cbc,
}

impl CipherKind {
    /// Key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            CipherKind::Aes128Cbc => 16,
            CipherKind::Aes192Cbc => 24,
            CipherKind::Aes256Cbc => 32,
        }
    }
}

impl fmt::Display for CipherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CipherKind::Aes128Cbc => "AES-128-CBC",
            CipherKind::Aes192Cbc => "AES-192-CBC",
            CipherKind::Aes256Cbc => "AES-256-CBC",
        };
        f.write_str(name)
    }
}

impl FromStr for CipherKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "AES-128-CBC" => Ok(CipherKind::Aes128Cbc),
            "AES-192-CBC" => Ok(CipherKind::Aes192Cbc),
            "AES-256-CBC" => Ok(CipherKind::Aes256Cbc),
            other => Err(ConfigError::Invalid(format!("unsupported cipher: {}", other))),
        }
    }
}

impl TryFrom<String> for CipherKind {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CipherKind> for String {
    fn from(value: CipherKind) -> Self {
        value.to_string()
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Verbosity threshold
    pub level: LogLevel,
}

/// Verbosity threshold for gateway logging
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Quiet,
    Errors,
    Normal,
    #[default]
    Verbose,
    Debug,
}

impl LogLevel {
    /// `tracing` filter directive for this level
    pub fn filter_directive(self) -> &'static str {
        match self {
            LogLevel::Quiet => "off",
            LogLevel::Errors => "error",
            LogLevel::Normal => "info",
            LogLevel::Verbose => "debug",
            LogLevel::Debug => "trace",
        }
    }
}

/// Used-token retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplayConfig {
    /// How long a consumed token stays marked as used
    #[serde(with = "duration_secs")]
    pub retention: Duration,

    /// How often expired records are swept
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
        }
    }
}

/// Which store backs the session registry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryBackend {
    /// In-process map; joins only work within one gateway instance
    #[default]
    Memory,
    /// Shared Redis store; joins work across gateway replicas
    Redis,
}

/// Session registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RegistryConfig {
    /// Backing store
    pub backend: RegistryBackend,

    /// Redis connection URL
    pub redis_url: String,

    /// Prefix prepended to session ids to form store keys
    pub key_prefix: String,

    /// Upper bound on a single registry round trip
    #[serde(with = "duration_millis")]
    pub op_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            backend: RegistryBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "tunnelgate:session:".to_string(),
            op_timeout: Duration::from_millis(2_000),
        }
    }
}

fn display_settings() -> Map<String, Value> {
    let value = json!({
        "width": 1024,
        "height": 768,
        "dpi": 96,
        "audio": ["audio/L16"],
        "image": ["image/png", "image/jpeg"],
    });
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn default_connection_settings() -> BTreeMap<String, Map<String, Value>> {
    let ports = [
        ("rdp", json!("3389")),
        ("vnc", json!("5900")),
        ("ssh", json!(22)),
        ("telnet", json!(23)),
    ];

    let mut defaults = BTreeMap::new();
    for (protocol, port) in ports {
        let mut settings = display_settings();
        settings.insert("port".to_string(), port);
        defaults.insert(protocol.to_string(), settings);
    }
    defaults.insert("join".to_string(), display_settings());
    defaults
}

fn default_allowed_settings() -> BTreeMap<String, Vec<String>> {
    let display = [
        "width",
        "height",
        "dpi",
        "audio",
        "video",
        "image",
        "timezone",
        "GUAC_AUDIO",
        "GUAC_VIDEO",
    ];
    let terminal = ["color-scheme", "font-name", "font-size"];

    BUILTIN_PROTOCOLS
        .iter()
        .map(|protocol| {
            let mut names: Vec<String> = Vec::new();
            if matches!(*protocol, "ssh" | "telnet") {
                names.extend(terminal.iter().map(|s| s.to_string()));
            }
            names.extend(display.iter().map(|s| s.to_string()));
            (protocol.to_string(), names)
        })
        .collect()
}
