//! Backend selection for new connections
//!
//! Decision order:
//! 1. no descriptor, or no `connection` in it: default backend
//! 2. `join` set: the backend recorded for the target session, or the
//!    default backend if the lookup misses or fails (still a join attempt)
//! 3. explicit host/port: used as given, each falling back to the default
//! 4. otherwise: default backend
//!
//! Routing never rejects a connection and never retries a failed lookup.

use std::sync::Arc;

use tg_core::traits::SessionRegistry;
use tg_core::{BackendAddr, SessionId};

use crate::token::{ConnectionDescriptor, ConnectionInfo};

/// Routing decision for one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// Backend daemon the tunnel connects to
    pub backend: BackendAddr,
    /// Whether the connection attaches to an existing session
    pub is_join: bool,
    /// Session the connection attaches to
    pub join_target: Option<SessionId>,
    /// Connection request from the token, if any
    pub connection: Option<ConnectionInfo>,
}

impl Route {
    fn default_for(backend: &BackendAddr, connection: Option<ConnectionInfo>) -> Self {
        Self {
            backend: backend.clone(),
            is_join: false,
            join_target: None,
            connection,
        }
    }
}

/// Resolves the backend for a connection from its decrypted token
pub struct RoutingResolver {
    default_backend: BackendAddr,
    registry: Arc<dyn SessionRegistry>,
}

impl RoutingResolver {
    /// Create a resolver
    pub fn new(default_backend: BackendAddr, registry: Arc<dyn SessionRegistry>) -> Self {
        Self {
            default_backend,
            registry,
        }
    }

    /// Decide where a connection goes
    pub async fn resolve(&self, descriptor: Option<&ConnectionDescriptor>) -> Route {
        let Some(descriptor) = descriptor else {
            tracing::debug!("No token provided, using default backend");
            return Route::default_for(&self.default_backend, None);
        };

        let Some(connection) = descriptor.connection.clone() else {
            tracing::debug!("No connection object in decrypted token, using default backend");
            return Route::default_for(&self.default_backend, None);
        };

        if let Some(target) = connection.join_target() {
            let target = SessionId::new(target);
            tracing::debug!("Join request for session {}", target);
            let backend = self.join_backend(&target).await;
            return Route {
                backend,
                is_join: true,
                join_target: Some(target),
                connection: Some(connection),
            };
        }

        let host = connection.backend_host.as_deref().filter(|h| !h.is_empty());
        if host.is_some() || connection.backend_port.is_some() {
            let backend = BackendAddr::new(
                host.unwrap_or(&self.default_backend.host),
                connection.backend_port.unwrap_or(self.default_backend.port),
            );
            tracing::info!("Routing new connection to backend {}", backend);
            return Route::default_for(&backend, Some(connection));
        }

        tracing::debug!("No backend routing in token, using default");
        Route::default_for(&self.default_backend, Some(connection))
    }

    /// Backend hosting `target`, falling back to the default on any miss
    async fn join_backend(&self, target: &SessionId) -> BackendAddr {
        match self.registry.get(target).await {
            Ok(Some(record)) => {
                let backend = record.backend();
                tracing::info!("Routing join request for session {} to backend {}", target, backend);
                backend
            }
            Ok(None) => {
                tracing::warn!(
                    "Session {} not found in registry, using default backend {}",
                    target,
                    self.default_backend
                );
                self.default_backend.clone()
            }
            Err(e) => {
                tracing::warn!(
                    "Error looking up session {}: {}; using default backend {}",
                    target,
                    e,
                    self.default_backend
                );
                self.default_backend.clone()
            }
        }
    }
}
