//! Admission endpoint listener
//!
//! Accepts WebSocket upgrades on any path until the gateway shuts down.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::gateway::Gateway;
use crate::server::handler;

/// Build the admission router
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/", get(handler::upgrade))
        .fallback(handler::upgrade)
        .with_state(gateway)
}

/// HTTP server fronting a [`Gateway`]
pub struct GatewayServer {
    gateway: Arc<Gateway>,
}

impl GatewayServer {
    /// Create a server for a gateway
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Bind and serve until the gateway shuts down
    pub async fn run(self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until the gateway shuts down
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Admission endpoint listening on ws://{}", local_addr);

        let shutdown = self.gateway.shutdown_token();
        let app = router(Arc::clone(&self.gateway));

        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("Admission endpoint shutting down");
            })
            .await
            .context("Admission endpoint failed")?;

        Ok(())
    }
}
