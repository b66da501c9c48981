//! tg-core: Core abstractions and configuration for tunnelgate
//!
//! This crate provides the shared types, error taxonomy, typed gateway
//! configuration and the session registry abstraction used by the gateway
//! daemon.

pub mod config;
pub mod error;
pub mod time;
pub mod traits;
pub mod types;

pub use error::{ConfigError, RegistryError, TokenError, TunnelError};
pub use types::{BackendAddr, ConnectionId, SessionId};
