//! Core error types for tunnelgate
//!
//! Each concern owns a small error enum. Only [`TokenError::Replay`] ever
//! refuses a connection outright; every other per-connection failure is
//! logged and degraded around by the gateway.

use std::path::PathBuf;
use std::time::Duration;

use tg_protocol::{ProtocolError, Status};
use thiserror::Error;

/// Token admission errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    /// The token was already admitted once
    #[error("Token already used {used_secs_ago} seconds ago")]
    Replay { used_secs_ago: u64 },

    /// The token could not be decoded or decrypted
    #[error("Failed to decrypt token: {0}")]
    Decryption(String),
}

/// Session registry errors
///
/// All backing stores report failures through this single variant so the
/// gateway never needs to know which store is active.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry could not complete the operation
    #[error("Session registry unavailable: {0}")]
    Unavailable(String),
}

impl RegistryError {
    /// Build an unavailable error from any displayable cause
    pub fn unavailable(cause: impl std::fmt::Display) -> Self {
        Self::Unavailable(cause.to_string())
    }
}

/// Tunnel errors, terminal for the affected connection only
#[derive(Error, Debug)]
pub enum TunnelError {
    /// Backend daemon refused the TCP connection
    #[error("Connection refused by backend {0}")]
    ConnectionRefused(String),

    /// Backend hostname did not resolve
    #[error("Backend host not found: {0}")]
    HostNotFound(String),

    /// Connecting to or hearing from the backend took too long
    #[error("Backend {0} timed out")]
    TimedOut(String),

    /// No traffic from the backend within the inactivity window
    #[error("No backend activity for {0:?}")]
    Inactive(Duration),

    /// Backend handshake did not follow the protocol
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Malformed instruction on the backend stream
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Other I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Status code reported to the client for this error
    pub fn status(&self) -> Status {
        match self {
            TunnelError::ConnectionRefused(_) => Status::UpstreamUnavailable,
            TunnelError::HostNotFound(_) => Status::UpstreamNotFound,
            TunnelError::TimedOut(_) => Status::UpstreamTimeout,
            TunnelError::Inactive(_) => Status::ClientTimeout,
            TunnelError::Handshake(_) | TunnelError::Protocol(_) => Status::UpstreamError,
            TunnelError::Io(_) => Status::ServerError,
        }
    }

    /// Operator-facing hint for connectivity failures
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            TunnelError::ConnectionRefused(_) => {
                Some("check that the backend daemon is running at the specified address")
            }
            TunnelError::HostNotFound(_) => Some("check the backend hostname/IP address"),
            TunnelError::TimedOut(_) => Some("check network connectivity to the backend"),
            _ => None,
        }
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Layered value did not match the configuration schema
    #[error("Config schema error: {0}")]
    Schema(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_message() {
        let err = TokenError::Replay { used_secs_ago: 5 };
        assert_eq!(err.to_string(), "Token already used 5 seconds ago");
    }

    #[test]
    fn test_tunnel_error_classification() {
        let refused = TunnelError::ConnectionRefused("127.0.0.1:4822".into());
        assert_eq!(refused.status(), Status::UpstreamUnavailable);
        assert!(refused.hint().is_some());

        let handshake = TunnelError::Handshake("unexpected opcode".into());
        assert_eq!(handshake.status(), Status::UpstreamError);
        assert!(handshake.hint().is_none());
    }
}
