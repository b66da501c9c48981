//! Tunnels to Guacamole-compatible backend daemons over TCP

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use tg_core::config::GatewayConfig;
use tg_core::{BackendAddr, SessionId, TunnelError};
use tg_protocol::{Instruction, InstructionCodec};

use super::{
    ClientFrame, ClientLink, TunnelEvent, TunnelFactory, TunnelRequest, CLOSE_INTERNAL_ERROR,
    CLOSE_NORMAL,
};
use crate::connection::ConnectionParams;

type DaemonStream = Framed<TcpStream, InstructionCodec>;

/// Opens one TCP connection to the backend daemon per tunnel
#[derive(Debug, Clone)]
pub struct GuacdConnector {
    /// Bound on resolving and connecting
    connect_timeout: Duration,
    /// Close the tunnel after this long without daemon traffic
    inactivity: Duration,
}

impl GuacdConnector {
    /// Create a connector with explicit timeouts
    pub fn new(connect_timeout: Duration, inactivity: Duration) -> Self {
        Self {
            connect_timeout,
            inactivity,
        }
    }

    /// Create a connector from gateway configuration
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(config.connect_timeout, config.max_inactivity_time)
    }

    async fn run(self, request: TunnelRequest, mut link: ClientLink, events: mpsc::Sender<TunnelEvent>) {
        let id = request.connection_id;

        match self.session(&request, &mut link, &events).await {
            Ok(()) => {
                tracing::debug!("Tunnel {} closed", id);
                let _ = link
                    .outbound
                    .send(ClientFrame::Close {
                        code: CLOSE_NORMAL,
                        reason: String::new(),
                    })
                    .await;
            }
            Err(err) => {
                tracing::debug!("Tunnel {} failed: {}", id, err);
                let status = err.status();
                let _ = link
                    .outbound
                    .send(ClientFrame::Text(
                        Instruction::error(err.to_string(), status.to_string()).encode(),
                    ))
                    .await;
                let _ = link
                    .outbound
                    .send(ClientFrame::Close {
                        code: CLOSE_INTERNAL_ERROR,
                        reason: err.to_string(),
                    })
                    .await;
                let _ = events.send(TunnelEvent::Error(err)).await;
            }
        }

        let _ = events.send(TunnelEvent::Closed).await;
    }

    async fn session(
        &self,
        request: &TunnelRequest,
        link: &mut ClientLink,
        events: &mpsc::Sender<TunnelEvent>,
    ) -> Result<(), TunnelError> {
        let select = request
            .params
            .select
            .clone()
            .ok_or_else(|| TunnelError::Handshake("connection type not specified".to_string()))?;

        let stream = tokio::select! {
            _ = request.closer.cancelled() => return Ok(()),
            stream = self.connect(&request.backend) => stream?,
        };
        tracing::debug!("Tunnel {} connected to backend {}", request.connection_id, request.backend);

        let mut daemon = Framed::new(stream, InstructionCodec::new());
        let session_id = tokio::select! {
            _ = request.closer.cancelled() => return Ok(()),
            id = self.handshake(&mut daemon, &select, &request.params) => id?,
        };

        let ready = Instruction::new("ready", [session_id.as_str()]);
        let _ = events.send(TunnelEvent::Ready { session_id }).await;
        if link.outbound.send(ClientFrame::Text(ready.encode())).await.is_err() {
            disconnect(&mut daemon).await;
            return Ok(());
        }

        self.relay(&mut daemon, request, link).await
    }

    async fn connect(&self, backend: &BackendAddr) -> Result<TcpStream, TunnelError> {
        let attempt = async {
            let mut addrs = tokio::net::lookup_host((backend.host.as_str(), backend.port))
                .await
                .map_err(|_| TunnelError::HostNotFound(backend.host.clone()))?;
            let addr = addrs
                .next()
                .ok_or_else(|| TunnelError::HostNotFound(backend.host.clone()))?;

            TcpStream::connect(addr).await.map_err(|e| match e.kind() {
                io::ErrorKind::ConnectionRefused => TunnelError::ConnectionRefused(backend.to_string()),
                io::ErrorKind::TimedOut => TunnelError::TimedOut(backend.to_string()),
                _ => TunnelError::Io(e),
            })
        };

        tokio::time::timeout(self.connect_timeout, attempt)
            .await
            .map_err(|_| TunnelError::TimedOut(backend.to_string()))?
    }

    /// Negotiate a session and return the id the daemon assigned
    async fn handshake(
        &self,
        daemon: &mut DaemonStream,
        select: &str,
        params: &ConnectionParams,
    ) -> Result<SessionId, TunnelError> {
        daemon.send(Instruction::new("select", [select])).await?;
        let args = self.expect(daemon, "args").await?;

        daemon
            .send(Instruction::new(
                "size",
                [params.value("width"), params.value("height"), params.value("dpi")],
            ))
            .await?;
        daemon.send(Instruction::new("audio", params.list("audio"))).await?;
        daemon.send(Instruction::new("video", params.list("video"))).await?;
        daemon.send(Instruction::new("image", params.list("image"))).await?;
        if let Some(timezone) = params.optional("timezone") {
            daemon.send(Instruction::new("timezone", [timezone])).await?;
        }

        let values: Vec<String> = args
            .args
            .iter()
            .map(|name| {
                if name.starts_with("VERSION_") {
                    name.clone()
                } else {
                    params.value(name)
                }
            })
            .collect();
        daemon.send(Instruction::new("connect", values)).await?;

        let ready = self.expect(daemon, "ready").await?;
        ready
            .arg(0)
            .filter(|id| !id.is_empty())
            .map(SessionId::new)
            .ok_or_else(|| TunnelError::Handshake("ready without a session id".to_string()))
    }

    async fn expect(&self, daemon: &mut DaemonStream, opcode: &str) -> Result<Instruction, TunnelError> {
        let next = tokio::time::timeout(self.inactivity, daemon.next())
            .await
            .map_err(|_| TunnelError::Inactive(self.inactivity))?;

        match next {
            Some(Ok(instruction)) if instruction.is(opcode) => Ok(instruction),
            Some(Ok(instruction)) if instruction.is("error") => Err(TunnelError::Handshake(format!(
                "backend rejected the connection: {}",
                instruction.arg(0).unwrap_or_default()
            ))),
            Some(Ok(instruction)) => Err(TunnelError::Handshake(format!(
                "expected {}, got {}",
                opcode, instruction.opcode
            ))),
            Some(Err(e)) => Err(e.into()),
            None => Err(TunnelError::Handshake(format!(
                "backend closed the connection while waiting for {}",
                opcode
            ))),
        }
    }

    async fn relay(
        &self,
        daemon: &mut DaemonStream,
        request: &TunnelRequest,
        link: &mut ClientLink,
    ) -> Result<(), TunnelError> {
        loop {
            tokio::select! {
                _ = request.closer.cancelled() => {
                    tracing::debug!("Tunnel {} close requested", request.connection_id);
                    disconnect(daemon).await;
                    return Ok(());
                }

                incoming = tokio::time::timeout(self.inactivity, daemon.next()) => {
                    match incoming {
                        Err(_) => return Err(TunnelError::Inactive(self.inactivity)),
                        Ok(None) => return Ok(()),
                        Ok(Some(Err(e))) => return Err(e.into()),
                        Ok(Some(Ok(instruction))) => {
                            let frame = ClientFrame::Text(instruction.encode());
                            if link.outbound.send(frame).await.is_err() {
                                disconnect(daemon).await;
                                return Ok(());
                            }
                        }
                    }
                }

                outgoing = link.inbound.recv() => {
                    match outgoing {
                        Some(text) => daemon.send(text).await?,
                        None => {
                            tracing::debug!("Client of tunnel {} went away", request.connection_id);
                            disconnect(daemon).await;
                            return Ok(());
                        }
                    }
                }
            }
        }
    }
}

/// Tell the daemon the session is over; failures are irrelevant at this point
async fn disconnect(daemon: &mut DaemonStream) {
    let _ = daemon.send(Instruction::new("disconnect", Vec::<String>::new())).await;
}

#[async_trait]
impl TunnelFactory for GuacdConnector {
    async fn create(&self, request: TunnelRequest, link: ClientLink) -> mpsc::Receiver<TunnelEvent> {
        let (events_tx, events_rx) = mpsc::channel(8);
        tokio::spawn(self.clone().run(request, link, events_tx));
        events_rx
    }
}
