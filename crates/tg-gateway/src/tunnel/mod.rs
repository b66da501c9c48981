//! Connection tunnels
//!
//! A tunnel relays one client connection to a backend daemon. The gateway
//! hands a [`TunnelFactory`] the routed request plus a [`ClientLink`] and
//! then consumes the tunnel's lifecycle from a single event channel.

mod guacd;

pub use guacd::GuacdConnector;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tg_core::{BackendAddr, ConnectionId, SessionId, TunnelError};

use crate::connection::ConnectionParams;

/// WebSocket close code for a normal close
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code for a policy violation (rejected token)
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code for an internal error (tunnel fault)
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Frame sent toward the client socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Encoded instruction text
    Text(String),
    /// Close the socket
    Close { code: u16, reason: String },
}

/// The client side of a connection as seen by a tunnel
#[derive(Debug)]
pub struct ClientLink {
    /// Frames for the client; closed once the client socket is gone
    pub outbound: mpsc::Sender<ClientFrame>,
    /// Text received from the client; ends when the client disconnects
    pub inbound: mpsc::Receiver<String>,
}

impl ClientLink {
    /// Create a link and the socket-side ends of its channels
    pub fn pair(capacity: usize) -> (Self, mpsc::Receiver<ClientFrame>, mpsc::Sender<String>) {
        let (outbound, outbound_rx) = mpsc::channel(capacity);
        let (inbound_tx, inbound) = mpsc::channel(capacity);
        (Self { outbound, inbound }, outbound_rx, inbound_tx)
    }

    /// Whether the client socket is still there
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }
}

/// A routed connection, ready for a tunnel
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    /// Gateway-local ordinal
    pub connection_id: ConnectionId,
    /// Backend daemon to connect to
    pub backend: BackendAddr,
    /// Merged connection parameters
    pub params: ConnectionParams,
    /// Cancelled when the gateway wants the tunnel closed
    pub closer: CancellationToken,
}

/// Lifecycle events emitted by a tunnel, in order
#[derive(Debug)]
pub enum TunnelEvent {
    /// The backend assigned a session id
    Ready { session_id: SessionId },
    /// The tunnel failed; a `Closed` follows
    Error(TunnelError),
    /// The tunnel is gone; always the last event
    Closed,
}

/// Creates tunnels for routed connections
#[async_trait]
pub trait TunnelFactory: Send + Sync {
    /// Start a tunnel and return its event stream.
    ///
    /// Dropping the sender without a `Closed` event counts as closed.
    async fn create(&self, request: TunnelRequest, link: ClientLink) -> mpsc::Receiver<TunnelEvent>;
}
