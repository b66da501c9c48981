//! Active-connection table

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use tg_core::{BackendAddr, ConnectionId, SessionId};

/// Gateway bookkeeping for one admitted connection
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    /// Gateway-local ordinal
    pub id: ConnectionId,
    /// Backend the tunnel was pointed at
    pub backend: BackendAddr,
    /// Whether the connection joined another session
    pub is_join: bool,
    /// Session the connection joined
    pub join_target: Option<SessionId>,
    /// Cancelling this asks the tunnel to close
    pub closer: CancellationToken,
}

impl ActiveConnection {
    /// Request the tunnel to close
    pub fn close(&self) {
        self.closer.cancel();
    }
}

/// Connections with a live tunnel, indexed by connection ID
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: DashMap<ConnectionId, ActiveConnection>,
}

impl ConnectionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Track a connection
    pub fn insert(&self, connection: ActiveConnection) {
        self.connections.insert(connection.id, connection);
    }

    /// Stop tracking a connection; removing twice is a no-op
    pub fn remove(&self, id: ConnectionId) -> Option<ActiveConnection> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    /// Request close on every tracked connection; returns how many
    pub fn close_all(&self) -> usize {
        let mut count = 0;
        for entry in self.connections.iter() {
            entry.value().close();
            count += 1;
        }
        count
    }

    /// Number of tracked connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check if no connections are tracked
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
