//! Effective connection parameters
//!
//! Layers, lowest first: configured defaults for the connection type, the
//! settings carried by the token, then allow-listed query parameters.

use std::collections::HashMap;

use serde_json::{Map, Value};

use tg_core::config::GatewayConfig;

use crate::routing::Route;

/// Settings the backend daemon is expected to receive as lists
const LIST_SETTINGS: [&str; 3] = ["audio", "video", "image"];

/// Parameters a tunnel opens its backend session with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionParams {
    /// Connection type whose defaults apply (`join` for joins)
    pub protocol: Option<String>,
    /// Value of the `select` handshake argument
    pub select: Option<String>,
    /// Merged settings
    pub settings: Map<String, Value>,
}

impl ConnectionParams {
    /// Build the parameters for a routed connection
    pub fn build(config: &GatewayConfig, route: &Route, query: &HashMap<String, String>) -> Self {
        let connection = route.connection.as_ref();

        let (protocol, select) = match &route.join_target {
            Some(target) => (Some("join".to_string()), Some(target.to_string())),
            None => {
                let kind = connection.and_then(|c| c.kind.clone()).filter(|k| !k.is_empty());
                (kind.clone(), kind)
            }
        };

        let mut settings = protocol
            .as_deref()
            .map(|p| config.default_settings_for(p))
            .unwrap_or_default();

        if let Some(connection) = connection {
            for (name, value) in &connection.settings {
                settings.insert(name.clone(), value.clone());
            }
        }

        if let Some(protocol) = protocol.as_deref() {
            for (name, value) in query {
                if name == "token" {
                    continue;
                }
                if !config.is_unencrypted_allowed(protocol, name) {
                    tracing::debug!("Ignoring unencrypted setting {} for {}", name, protocol);
                    continue;
                }
                let (name, value) = unencrypted_setting(name, value);
                settings.insert(name, value);
            }
        }

        Self {
            protocol,
            select,
            settings,
        }
    }

    /// Setting rendered as a handshake argument; missing and null are empty
    pub fn value(&self, name: &str) -> String {
        match self.settings.get(name) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(items)) => items.iter().map(scalar).collect::<Vec<_>>().join(","),
            Some(other) => scalar(other),
        }
    }

    /// Setting rendered as a list of handshake arguments
    pub fn list(&self, name: &str) -> Vec<String> {
        match self.settings.get(name) {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(scalar).collect(),
            Some(Value::String(s)) => split_list(s)
                .into_iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            Some(other) => vec![scalar(other)],
        }
    }

    /// Setting as a non-empty string, if present
    pub fn optional(&self, name: &str) -> Option<String> {
        Some(self.value(name)).filter(|v| !v.is_empty())
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn split_list(raw: &str) -> Vec<Value> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| Value::String(s.to_string()))
        .collect()
}

/// Normalize a query parameter; legacy `GUAC_*` names map onto the modern ones
fn unencrypted_setting(name: &str, raw: &str) -> (String, Value) {
    let name = match name {
        "GUAC_AUDIO" => "audio",
        "GUAC_VIDEO" => "video",
        other => other,
    };

    let value = if LIST_SETTINGS.contains(&name) {
        Value::Array(split_list(raw))
    } else {
        Value::String(raw.to_string())
    };
    (name.to_string(), value)
}
