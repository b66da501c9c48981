//! WebSocket admission endpoint

mod handler;
mod listener;

pub use handler::GUACAMOLE_SUBPROTOCOL;
pub use listener::{router, GatewayServer};
