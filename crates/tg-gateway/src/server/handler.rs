//! WebSocket admission handler
//!
//! Each upgraded socket is bridged to a [`ClientLink`] by two pump tasks
//! while the gateway admits the connection and drives its tunnel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};

use crate::gateway::Gateway;
use crate::tunnel::{ClientFrame, ClientLink};

/// Subprotocol spoken by Guacamole JavaScript clients
pub const GUACAMOLE_SUBPROTOCOL: &str = "guacamole";

/// Buffered frames per direction
const LINK_CAPACITY: usize = 64;

/// Close reasons are limited to 123 bytes on the wire
const MAX_CLOSE_REASON: usize = 123;

/// Upgrade handler for the admission endpoint
pub async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    State(gateway): State<Arc<Gateway>>,
) -> Response {
    tracing::debug!("Upgrade request from {}", peer);
    ws.protocols([GUACAMOLE_SUBPROTOCOL])
        .on_upgrade(move |socket| handle_socket(socket, peer, query, gateway))
}

async fn handle_socket(
    socket: WebSocket,
    peer: SocketAddr,
    query: HashMap<String, String>,
    gateway: Arc<Gateway>,
) {
    let (link, mut frames, client_tx) = ClientLink::pair(LINK_CAPACITY);
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match frame {
                ClientFrame::Text(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                ClientFrame::Close { code, reason } => {
                    let close = CloseFrame {
                        code,
                        reason: truncate_reason(reason).into(),
                    };
                    let _ = sink.send(Message::Close(Some(close))).await;
                    break;
                }
            }
        }
    });

    let reader = tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if client_tx.send(text).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("WebSocket read error from {}: {}", peer, e);
                    break;
                }
            }
        }
    });

    gateway.handle_connection(query, link).await;

    // The link is gone once the tunnel finished, so the writer drains and exits
    let _ = writer.await;
    reader.abort();
    tracing::debug!("Socket from {} finished", peer);
}

fn truncate_reason(mut reason: String) -> String {
    if reason.len() > MAX_CLOSE_REASON {
        let mut end = MAX_CLOSE_REASON;
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        reason.truncate(end);
    }
    reason
}
