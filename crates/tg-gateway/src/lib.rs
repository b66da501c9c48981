//! tg-gateway: tunnelgate daemon
//!
//! Terminates browser WebSocket tunnels and routes each one to a
//! remote-desktop backend daemon chosen from an encrypted, single-use
//! token. Connections may join sessions hosted on other backends through a
//! shared session registry.

pub mod connection;
pub mod gateway;
pub mod registry;
pub mod routing;
pub mod server;
pub mod token;
pub mod tunnel;

pub use gateway::{Gateway, GatewayEvent};
pub use routing::{Route, RoutingResolver};
pub use server::GatewayServer;
pub use token::{ReplayGuard, TokenCodec};
pub use tunnel::{GuacdConnector, TunnelFactory};
