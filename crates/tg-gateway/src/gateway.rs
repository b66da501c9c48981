//! Connection orchestrator
//!
//! The [`Gateway`] owns every piece of shared state (used tokens, the
//! session registry handle, the active-connection table) and sequences each
//! connection through replay check, routing, tunnel creation and registry
//! bookkeeping. Per-connection failures are logged and contained here; the
//! only hard rejection is a replayed token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tg_core::config::GatewayConfig;
use tg_core::traits::{CasOutcome, JoinRecord, SessionRecord, SessionRegistry};
use tg_core::{BackendAddr, ConnectionId, RegistryError, SessionId, TunnelError};
use tg_protocol::{Instruction, Status};

use crate::connection::{ActiveConnection, ConnectionParams, ConnectionState, ConnectionTable};
use crate::routing::{Route, RoutingResolver};
use crate::token::{run_token_sweep, ReplayGuard, TokenCodec};
use crate::tunnel::{
    ClientFrame, ClientLink, TunnelEvent, TunnelFactory, TunnelRequest, CLOSE_POLICY_VIOLATION,
};

/// Attempts at a version-checked join-list update before giving up
const MAX_UPDATE_ATTEMPTS: usize = 5;

/// Capacity of the lifecycle event channel
const EVENT_CAPACITY: usize = 256;

/// Lifecycle notifications for embedders and tests
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// A tunnel became ready
    Opened {
        connection_id: ConnectionId,
        session_id: SessionId,
        backend: BackendAddr,
        is_join: bool,
    },
    /// A tunnel closed and its bookkeeping is done
    Closed {
        connection_id: ConnectionId,
        session_id: Option<SessionId>,
        error: Option<String>,
    },
    /// A tunnel failed
    Error {
        connection_id: ConnectionId,
        backend: BackendAddr,
        status: Status,
        message: String,
    },
}

/// The connection orchestrator
pub struct Gateway {
    config: GatewayConfig,
    replay: Arc<ReplayGuard>,
    tokens: TokenCodec,
    resolver: RoutingResolver,
    registry: Arc<dyn SessionRegistry>,
    tunnels: Arc<dyn TunnelFactory>,
    connections: ConnectionTable,
    /// Incremented for every admitted socket, rejected ones included
    next_id: AtomicU64,
    events: broadcast::Sender<GatewayEvent>,
    shutdown: CancellationToken,
}

impl Gateway {
    /// Create a gateway; call [`Gateway::start`] to begin background work
    pub fn new(
        config: GatewayConfig,
        registry: Arc<dyn SessionRegistry>,
        tunnels: Arc<dyn TunnelFactory>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            replay: Arc::new(ReplayGuard::new(config.replay.retention)),
            tokens: TokenCodec::new(&config.crypt),
            resolver: RoutingResolver::new(config.backend.clone(), Arc::clone(&registry)),
            registry,
            tunnels,
            connections: ConnectionTable::new(),
            next_id: AtomicU64::new(0),
            events,
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// Start the used-token sweep; it stops when the gateway shuts down
    pub fn start(&self) -> JoinHandle<()> {
        tokio::spawn(run_token_sweep(
            Arc::clone(&self.replay),
            self.config.replay.sweep_interval,
            self.shutdown.clone(),
        ))
    }

    /// Gateway configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// Token cancelled when the gateway shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of connections with a live tunnel
    pub fn active_connections(&self) -> usize {
        self.connections.len()
    }

    /// Replay guard shared by all connections
    pub fn replay_guard(&self) -> &Arc<ReplayGuard> {
        &self.replay
    }

    /// Stop the sweep and ask every tunnel to close.
    ///
    /// Does not wait for tunnels or in-flight registry writes; a session
    /// whose close is interrupted by process exit may stay registered.
    pub fn shutdown(&self) {
        tracing::info!("Closing all connections...");
        self.shutdown.cancel();
        let closed = self.connections.close_all();
        tracing::debug!("Requested close of {} connections", closed);
    }

    /// Admit one client connection and drive it until its tunnel closes
    pub async fn handle_connection(&self, query: HashMap<String, String>, link: ClientLink) {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut state = ConnectionState::Admitted;

        let token = query.get("token").map(String::as_str).filter(|t| !t.is_empty());

        if let Some(token) = token {
            if let Err(e) = self.replay.validate_and_mark(token) {
                tracing::error!("[Connection {}] Token validation failed: {}", id, e);
                reject(&link, &e.to_string()).await;
                state.advance(ConnectionState::Closed);
                return;
            }
        }
        state.advance(ConnectionState::ReplayChecked);

        let descriptor = token.and_then(|token| match self.tokens.decrypt(token) {
            Ok(descriptor) => Some(descriptor),
            Err(e) => {
                tracing::warn!("[Connection {}] {}; using default routing", id, e);
                None
            }
        });
        let route = self.resolver.resolve(descriptor.as_ref()).await;
        state.advance(ConnectionState::Routed);

        if !link.is_open() {
            tracing::debug!(
                "[Connection {}] Connection closed during initialization, skipping connect",
                id
            );
            state.advance(ConnectionState::Closed);
            return;
        }

        let closer = self.shutdown.child_token();
        let request = TunnelRequest {
            connection_id: id,
            backend: route.backend.clone(),
            params: ConnectionParams::build(&self.config, &route, &query),
            closer: closer.clone(),
        };

        tracing::info!("[Connection {}] Connecting to backend {}", id, route.backend);
        let events = self.tunnels.create(request, link).await;
        self.connections.insert(ActiveConnection {
            id,
            backend: route.backend.clone(),
            is_join: route.is_join,
            join_target: route.join_target.clone(),
            closer,
        });
        state.advance(ConnectionState::TunnelCreated);

        self.drive(id, &route, state, events).await;
    }

    /// Consume tunnel events until the tunnel is gone
    async fn drive(
        &self,
        id: ConnectionId,
        route: &Route,
        mut state: ConnectionState,
        mut events: tokio::sync::mpsc::Receiver<TunnelEvent>,
    ) {
        let mut session: Option<SessionId> = None;
        let mut last_error: Option<String> = None;

        while let Some(event) = events.recv().await {
            match event {
                TunnelEvent::Ready { session_id } => {
                    state.advance(ConnectionState::Open);
                    self.on_ready(id, route, &session_id).await;
                    self.emit(GatewayEvent::Opened {
                        connection_id: id,
                        session_id: session_id.clone(),
                        backend: route.backend.clone(),
                        is_join: route.is_join,
                    });
                    session = Some(session_id);
                }
                TunnelEvent::Error(err) => {
                    state.advance(ConnectionState::Error);
                    self.on_error(id, route, &err);
                    last_error = Some(err.to_string());
                }
                TunnelEvent::Closed => break,
            }
        }

        if let Some(session_id) = &session {
            self.on_close(route, session_id).await;
        }
        self.connections.remove(id);
        state.advance(ConnectionState::Closed);

        tracing::info!("[Connection {}] Closed ({})", id, state);
        self.emit(GatewayEvent::Closed {
            connection_id: id,
            session_id: session,
            error: last_error,
        });
    }

    async fn on_ready(&self, id: ConnectionId, route: &Route, session_id: &SessionId) {
        let result = match &route.join_target {
            Some(target) => self.attach(id, route, target, session_id).await,
            None => self.register(route, session_id).await,
        };

        if let Err(e) = result {
            tracing::error!("[SessionRegistry] Failed to register/update session: {}", e);
        }
    }

    /// Record a new primary session
    async fn register(&self, route: &Route, session_id: &SessionId) -> Result<(), RegistryError> {
        let connection_info = route
            .connection
            .as_ref()
            .and_then(|c| serde_json::to_value(c).ok());
        let record = SessionRecord::new(&route.backend, connection_info);

        self.registry.set(session_id, record).await?;
        tracing::debug!(
            "[SessionRegistry] Registered new session {} on backend {}",
            session_id,
            route.backend
        );
        Ok(())
    }

    /// Add a joined connection to its target session
    async fn attach(
        &self,
        id: ConnectionId,
        route: &Route,
        target: &SessionId,
        session_id: &SessionId,
    ) -> Result<(), RegistryError> {
        let join = JoinRecord {
            connection_id: id,
            tunnel_session_id: session_id.clone(),
            joined_at: Utc::now(),
            join_settings: route
                .connection
                .as_ref()
                .map(|c| c.settings.clone())
                .unwrap_or_default(),
        };

        let updated = self
            .update_session(target, |record| record.joined_connections.push(join.clone()))
            .await?;

        if updated {
            tracing::debug!(
                "[SessionRegistry] Added join connection {} to session {}",
                session_id,
                target
            );
        } else {
            tracing::warn!(
                "[SessionRegistry] Cannot add join to session {} - session not found",
                target
            );
        }
        Ok(())
    }

    async fn on_close(&self, route: &Route, session_id: &SessionId) {
        let result = match &route.join_target {
            Some(target) => self.detach(target, session_id).await,
            None => self.unregister(session_id).await,
        };

        if let Err(e) = result {
            tracing::error!("[SessionRegistry] Failed to remove session: {}", e);
        }
    }

    async fn detach(&self, target: &SessionId, session_id: &SessionId) -> Result<(), RegistryError> {
        let updated = self
            .update_session(target, |record| {
                record
                    .joined_connections
                    .retain(|join| &join.tunnel_session_id != session_id)
            })
            .await?;

        if updated {
            tracing::debug!(
                "[SessionRegistry] Removed join connection {} from session {}",
                session_id,
                target
            );
        }
        Ok(())
    }

    async fn unregister(&self, session_id: &SessionId) -> Result<(), RegistryError> {
        self.registry.delete(session_id).await?;
        tracing::debug!("[SessionRegistry] Removed primary session {}", session_id);
        Ok(())
    }

    /// Read-modify-write a session record with version-checked writes.
    ///
    /// Returns `Ok(false)` if the record does not exist.
    async fn update_session<F>(&self, id: &SessionId, mut modify: F) -> Result<bool, RegistryError>
    where
        F: FnMut(&mut SessionRecord),
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let Some(mut record) = self.registry.get(id).await? else {
                return Ok(false);
            };
            let expected = record.version;
            modify(&mut record);

            match self.registry.compare_and_set(id, expected, record).await? {
                CasOutcome::Written => return Ok(true),
                CasOutcome::Missing => return Ok(false),
                CasOutcome::Conflict => {
                    tracing::debug!(
                        "[SessionRegistry] Concurrent update of session {} (attempt {})",
                        id,
                        attempt
                    );
                }
            }
        }

        Err(RegistryError::unavailable(format!(
            "session {} kept changing after {} attempts",
            id, MAX_UPDATE_ATTEMPTS
        )))
    }

    fn on_error(&self, id: ConnectionId, route: &Route, err: &TunnelError) {
        tracing::error!("[Server] Connection error (Connection ID: {}): {}", id, err);
        if let Some(hint) = err.hint() {
            tracing::error!("[Server] backend {}: {}", route.backend, hint);
        }

        self.emit(GatewayEvent::Error {
            connection_id: id,
            backend: route.backend.clone(),
            status: err.status(),
            message: err.to_string(),
        });
    }

    fn emit(&self, event: GatewayEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Send the token error instruction and close with a policy violation
async fn reject(link: &ClientLink, reason: &str) {
    let frame = Instruction::error("Token validation failed", "INVALID_TOKEN").encode();
    let _ = link.outbound.send(ClientFrame::Text(frame)).await;
    let _ = link
        .outbound
        .send(ClientFrame::Close {
            code: CLOSE_POLICY_VIOLATION,
            reason: reason.to_string(),
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use crate::registry::MemoryRegistry;

    const KEY: &str = "MySuperSecretKeyForParamsToken12";

    /// Scripted tunnel: reports ready with a fixed session id, then waits
    /// for a close request or the client to go away
    struct ScriptedTunnels {
        session_ids: Mutex<Vec<&'static str>>,
        requests: Mutex<Vec<TunnelRequest>>,
        fail_with: Option<fn() -> TunnelError>,
    }

    impl ScriptedTunnels {
        fn new(session_ids: Vec<&'static str>) -> Self {
            Self {
                session_ids: Mutex::new(session_ids),
                requests: Mutex::new(Vec::new()),
                fail_with: None,
            }
        }

        fn failing(err: fn() -> TunnelError) -> Self {
            Self {
                fail_with: Some(err),
                ..Self::new(Vec::new())
            }
        }

        fn created(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl TunnelFactory for ScriptedTunnels {
        async fn create(&self, request: TunnelRequest, mut link: ClientLink) -> mpsc::Receiver<TunnelEvent> {
            let (tx, rx) = mpsc::channel(8);
            let closer = request.closer.clone();
            let session = {
                let mut ids = self.session_ids.lock().unwrap();
                (!ids.is_empty()).then(|| ids.remove(0))
            };
            let fail_with = self.fail_with;
            self.requests.lock().unwrap().push(request);

            tokio::spawn(async move {
                if let Some(err) = fail_with {
                    let _ = tx.send(TunnelEvent::Error(err())).await;
                    let _ = tx.send(TunnelEvent::Closed).await;
                    return;
                }
                if let Some(id) = session {
                    let _ = tx.send(TunnelEvent::Ready { session_id: SessionId::new(id) }).await;
                }
                tokio::select! {
                    _ = closer.cancelled() => {}
                    _ = link.inbound.recv() => {}
                }
                let _ = tx.send(TunnelEvent::Closed).await;
            });
            rx
        }
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.crypt.key = Some(KEY.to_string());
        config
    }

    fn gateway(tunnels: Arc<ScriptedTunnels>) -> (Arc<Gateway>, Arc<MemoryRegistry>) {
        let registry = Arc::new(MemoryRegistry::new());
        (gateway_with(tunnels, registry.clone()), registry)
    }

    fn gateway_with(tunnels: Arc<ScriptedTunnels>, registry: Arc<dyn SessionRegistry>) -> Arc<Gateway> {
        Arc::new(Gateway::new(config(), registry, tunnels))
    }

    fn join_record(connection_id: u64, tunnel_session_id: &str) -> JoinRecord {
        JoinRecord {
            connection_id: ConnectionId::new(connection_id),
            tunnel_session_id: SessionId::new(tunnel_session_id),
            joined_at: Utc::now(),
            join_settings: Default::default(),
        }
    }

    fn joined(record: &SessionRecord) -> Vec<&str> {
        record
            .joined_connections
            .iter()
            .map(|j| j.tunnel_session_id.as_str())
            .collect()
    }

    /// Writes a competing join between the gateway's read and its first
    /// version-checked write
    struct RacingRegistry {
        inner: MemoryRegistry,
        raced: AtomicBool,
    }

    #[async_trait]
    impl SessionRegistry for RacingRegistry {
        async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, RegistryError> {
            self.inner.get(id).await
        }

        async fn set(&self, id: &SessionId, record: SessionRecord) -> Result<(), RegistryError> {
            self.inner.set(id, record).await
        }

        async fn delete(&self, id: &SessionId) -> Result<(), RegistryError> {
            self.inner.delete(id).await
        }

        async fn compare_and_set(
            &self,
            id: &SessionId,
            expected_version: u64,
            record: SessionRecord,
        ) -> Result<CasOutcome, RegistryError> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                if let Some(mut current) = self.inner.get(id).await? {
                    let version = current.version;
                    current.joined_connections.push(join_record(99, "$other"));
                    self.inner.compare_and_set(id, version, current).await?;
                }
            }
            self.inner.compare_and_set(id, expected_version, record).await
        }
    }

    /// Every version-checked write loses to a concurrent writer
    struct ContendedRegistry {
        inner: MemoryRegistry,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl SessionRegistry for ContendedRegistry {
        async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, RegistryError> {
            self.inner.get(id).await
        }

        async fn set(&self, id: &SessionId, record: SessionRecord) -> Result<(), RegistryError> {
            self.inner.set(id, record).await
        }

        async fn delete(&self, id: &SessionId) -> Result<(), RegistryError> {
            self.inner.delete(id).await
        }

        async fn compare_and_set(
            &self,
            _id: &SessionId,
            _expected_version: u64,
            _record: SessionRecord,
        ) -> Result<CasOutcome, RegistryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Ok(CasOutcome::Conflict)
        }
    }

    /// Reads find nothing and every write fails
    struct UnwritableRegistry;

    #[async_trait]
    impl SessionRegistry for UnwritableRegistry {
        async fn get(&self, _id: &SessionId) -> Result<Option<SessionRecord>, RegistryError> {
            Ok(None)
        }

        async fn set(&self, _id: &SessionId, _record: SessionRecord) -> Result<(), RegistryError> {
            Err(RegistryError::unavailable("connection reset"))
        }

        async fn delete(&self, _id: &SessionId) -> Result<(), RegistryError> {
            Err(RegistryError::unavailable("connection reset"))
        }

        async fn compare_and_set(
            &self,
            _id: &SessionId,
            _expected_version: u64,
            _record: SessionRecord,
        ) -> Result<CasOutcome, RegistryError> {
            Err(RegistryError::unavailable("connection reset"))
        }
    }

    fn token(payload: serde_json::Value) -> String {
        TokenCodec::new(&config().crypt).seal(&payload).unwrap()
    }

    fn query(token: &str) -> HashMap<String, String> {
        HashMap::from([("token".to_string(), token.to_string())])
    }

    async fn next_opened(events: &mut broadcast::Receiver<GatewayEvent>) -> SessionId {
        loop {
            if let GatewayEvent::Opened { session_id, .. } = events.recv().await.unwrap() {
                return session_id;
            }
        }
    }

    async fn next_closed(events: &mut broadcast::Receiver<GatewayEvent>) -> ConnectionId {
        loop {
            if let GatewayEvent::Closed { connection_id, .. } = events.recv().await.unwrap() {
                return connection_id;
            }
        }
    }

    #[tokio::test]
    async fn test_replayed_token_is_rejected_before_any_tunnel() {
        let tunnels = Arc::new(ScriptedTunnels::new(vec!["$primary"]));
        let (gateway, registry) = gateway(tunnels.clone());
        let token = token(json!({"connection": {"type": "rdp"}}));

        // First use is admitted and closed by the client
        let (link, _frames, client) = ClientLink::pair(8);
        let mut events = gateway.subscribe();
        let g = Arc::clone(&gateway);
        let q = query(&token);
        let first = tokio::spawn(async move { g.handle_connection(q, link).await });
        next_opened(&mut events).await;
        drop(client);
        first.await.unwrap();

        // Second use never reaches the tunnel factory
        let (link, mut frames, _client) = ClientLink::pair(8);
        gateway.handle_connection(query(&token), link).await;

        assert_eq!(
            frames.recv().await,
            Some(ClientFrame::Text(
                "5.error,23.Token validation failed,13.INVALID_TOKEN;".to_string()
            ))
        );
        assert!(matches!(
            frames.recv().await,
            Some(ClientFrame::Close { code: CLOSE_POLICY_VIOLATION, .. })
        ));
        assert_eq!(tunnels.created(), 1);
        assert_eq!(gateway.active_connections(), 0);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_primary_session_registered_then_removed() {
        let tunnels = Arc::new(ScriptedTunnels::new(vec!["$X"]));
        let (gateway, registry) = gateway(tunnels);
        let token = token(json!({"connection": {"type": "rdp", "backendHost": "10.0.0.5"}}));

        let mut events = gateway.subscribe();
        let (link, _frames, client) = ClientLink::pair(8);
        let g = Arc::clone(&gateway);
        let task = tokio::spawn(async move { g.handle_connection(query(&token), link).await });

        assert_eq!(next_opened(&mut events).await, SessionId::new("$X"));
        let record = registry.get(&SessionId::new("$X")).await.unwrap().unwrap();
        assert_eq!(record.backend(), BackendAddr::new("10.0.0.5", 4822));
        assert!(record.joined_connections.is_empty());
        assert_eq!(record.connection_info.unwrap()["type"], "rdp");
        assert_eq!(gateway.active_connections(), 1);

        drop(client);
        task.await.unwrap();
        assert!(registry.get(&SessionId::new("$X")).await.unwrap().is_none());
        assert_eq!(gateway.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_join_appends_and_removes_only_its_entry() {
        let tunnels = Arc::new(ScriptedTunnels::new(vec!["$J1", "$J2"]));
        let (gateway, registry) = gateway(tunnels);
        let target = SessionId::new("$S1");
        registry
            .set(&target, SessionRecord::new(&BackendAddr::new("10.0.0.5", 4822), None))
            .await
            .unwrap();

        let mut events = gateway.subscribe();
        let mut clients = Vec::new();
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let token = token(json!({"connection": {"join": "$S1"}}));
            let (link, _frames, client) = ClientLink::pair(8);
            let g = Arc::clone(&gateway);
            tasks.push(tokio::spawn(async move {
                let _frames = _frames;
                g.handle_connection(query(&token), link).await
            }));
            next_opened(&mut events).await;
            clients.push(client);
        }

        let record = registry.get(&target).await.unwrap().unwrap();
        let joined: Vec<_> = record
            .joined_connections
            .iter()
            .map(|j| j.tunnel_session_id.as_str())
            .collect();
        assert_eq!(joined, vec!["$J1", "$J2"]);

        // Close the first joiner only
        drop(clients.remove(0));
        tasks.remove(0).await.unwrap();

        let record = registry.get(&target).await.unwrap().unwrap();
        assert_eq!(record.joined_connections.len(), 1);
        assert_eq!(record.joined_connections[0].tunnel_session_id, SessionId::new("$J2"));
    }

    #[tokio::test]
    async fn test_concurrent_join_update_is_not_lost() {
        let tunnels = Arc::new(ScriptedTunnels::new(vec!["$J"]));
        let registry = Arc::new(RacingRegistry {
            inner: MemoryRegistry::new(),
            raced: AtomicBool::new(false),
        });
        let gateway = gateway_with(tunnels, registry.clone());
        let target = SessionId::new("$S1");
        registry
            .set(&target, SessionRecord::new(&BackendAddr::new("10.0.0.5", 4822), None))
            .await
            .unwrap();

        let mut events = gateway.subscribe();
        let token = token(json!({"connection": {"join": "$S1"}}));
        let (link, _frames, client) = ClientLink::pair(8);
        let g = Arc::clone(&gateway);
        let task = tokio::spawn(async move { g.handle_connection(query(&token), link).await });
        next_opened(&mut events).await;

        // The first write conflicted; the retry kept the competing entry
        let record = registry.get(&target).await.unwrap().unwrap();
        assert_eq!(joined(&record), vec!["$other", "$J"]);
        assert_eq!(record.version, 2);

        drop(client);
        task.await.unwrap();

        let record = registry.get(&target).await.unwrap().unwrap();
        assert_eq!(joined(&record), vec!["$other"]);
    }

    #[tokio::test]
    async fn test_join_update_gives_up_after_max_attempts() {
        let tunnels = Arc::new(ScriptedTunnels::new(vec!["$J"]));
        let registry = Arc::new(ContendedRegistry {
            inner: MemoryRegistry::new(),
            attempts: AtomicUsize::new(0),
        });
        let gateway = gateway_with(tunnels, registry.clone());
        let target = SessionId::new("$S1");
        registry
            .set(&target, SessionRecord::new(&BackendAddr::new("10.0.0.5", 4822), None))
            .await
            .unwrap();

        let result = gateway
            .update_session(&target, |record| record.joined_connections.push(join_record(1, "$J")))
            .await;
        assert!(matches!(result, Err(RegistryError::Unavailable(_))));
        assert_eq!(registry.attempts.load(Ordering::SeqCst), MAX_UPDATE_ATTEMPTS);

        // The failed bookkeeping leaves the tunnel open
        let mut events = gateway.subscribe();
        let token = token(json!({"connection": {"join": "$S1"}}));
        let (link, _frames, client) = ClientLink::pair(8);
        let g = Arc::clone(&gateway);
        let task = tokio::spawn(async move { g.handle_connection(query(&token), link).await });

        assert_eq!(next_opened(&mut events).await, SessionId::new("$J"));
        assert_eq!(gateway.active_connections(), 1);
        let record = registry.get(&target).await.unwrap().unwrap();
        assert!(record.joined_connections.is_empty());

        drop(client);
        task.await.unwrap();
        assert_eq!(gateway.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_registry_write_failures_do_not_close_tunnel() {
        let tunnels = Arc::new(ScriptedTunnels::new(vec!["$X"]));
        let gateway = gateway_with(tunnels, Arc::new(UnwritableRegistry));

        let mut events = gateway.subscribe();
        let (link, _frames, client) = ClientLink::pair(8);
        let g = Arc::clone(&gateway);
        let task = tokio::spawn(async move { g.handle_connection(HashMap::new(), link).await });

        assert_eq!(next_opened(&mut events).await, SessionId::new("$X"));
        assert_eq!(gateway.active_connections(), 1);

        drop(client);
        task.await.unwrap();
        assert_eq!(gateway.active_connections(), 0);
        match events.recv().await.unwrap() {
            GatewayEvent::Closed { session_id, error, .. } => {
                assert_eq!(session_id, Some(SessionId::new("$X")));
                assert!(error.is_none());
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_join_to_missing_session_still_opens() {
        let tunnels = Arc::new(ScriptedTunnels::new(vec!["$J1"]));
        let (gateway, registry) = gateway(tunnels.clone());
        let token = token(json!({"connection": {"join": "$gone"}}));

        let mut events = gateway.subscribe();
        let (link, _frames, client) = ClientLink::pair(8);
        let g = Arc::clone(&gateway);
        let task = tokio::spawn(async move { g.handle_connection(query(&token), link).await });

        next_opened(&mut events).await;
        assert!(registry.is_empty());
        let request = tunnels.requests.lock().unwrap()[0].clone();
        assert_eq!(request.backend, BackendAddr::default());
        assert_eq!(request.params.select.as_deref(), Some("$gone"));

        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_undecryptable_token_routes_to_default() {
        let tunnels = Arc::new(ScriptedTunnels::new(vec!["$X"]));
        let (gateway, _registry) = gateway(tunnels.clone());

        let (link, _frames, client) = ClientLink::pair(8);
        drop(client);
        gateway.handle_connection(query("bm90IGEgdG9rZW4="), link).await;

        let request = tunnels.requests.lock().unwrap()[0].clone();
        assert_eq!(request.backend, BackendAddr::default());
        // Even an unusable token is burned
        assert_eq!(gateway.replay_guard().len(), 1);
    }

    #[tokio::test]
    async fn test_closed_client_skips_tunnel() {
        let tunnels = Arc::new(ScriptedTunnels::new(vec!["$X"]));
        let (gateway, _registry) = gateway(tunnels.clone());

        let (link, frames, _client) = ClientLink::pair(8);
        drop(frames);
        gateway.handle_connection(HashMap::new(), link).await;

        assert_eq!(tunnels.created(), 0);
        assert_eq!(gateway.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_tunnel_error_is_contained() {
        let tunnels = Arc::new(ScriptedTunnels::failing(|| {
            TunnelError::ConnectionRefused("127.0.0.1:4822".to_string())
        }));
        let (gateway, registry) = gateway(tunnels);
        let mut events = gateway.subscribe();

        let (link, _frames, _client) = ClientLink::pair(8);
        gateway.handle_connection(HashMap::new(), link).await;

        match events.recv().await.unwrap() {
            GatewayEvent::Error { status, .. } => assert_eq!(status, Status::UpstreamUnavailable),
            other => panic!("unexpected event {:?}", other),
        }
        match events.recv().await.unwrap() {
            GatewayEvent::Closed { session_id, error, .. } => {
                assert!(session_id.is_none());
                assert!(error.unwrap().contains("refused"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(registry.is_empty());
        assert_eq!(gateway.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_active_tunnels() {
        let tunnels = Arc::new(ScriptedTunnels::new(vec!["$A", "$B"]));
        let (gateway, registry) = gateway(tunnels);
        let sweep = gateway.start();

        let mut events = gateway.subscribe();
        let mut clients = Vec::new();
        for _ in 0..2 {
            let (link, _frames, client) = ClientLink::pair(8);
            let g = Arc::clone(&gateway);
            tokio::spawn(async move {
                let _frames = _frames;
                g.handle_connection(HashMap::new(), link).await
            });
            next_opened(&mut events).await;
            clients.push(client);
        }
        assert_eq!(registry.len(), 2);

        gateway.shutdown();
        let mut closed = vec![next_closed(&mut events).await, next_closed(&mut events).await];
        closed.sort();
        assert_eq!(closed, vec![ConnectionId::new(1), ConnectionId::new(2)]);
        sweep.await.unwrap();
        assert!(registry.is_empty());
    }
}
