//! Session registry traits

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RegistryError;
use crate::types::{BackendAddr, ConnectionId, SessionId};

/// A live session and the connections joined to it
///
/// A record exists while the primary connection's tunnel is open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    /// Backend daemon hosting the session
    pub backend_host: String,
    /// Backend daemon port
    pub backend_port: u16,
    /// Connection settings the primary connection was opened with
    #[serde(default)]
    pub connection_info: Option<Value>,
    /// When the primary tunnel became ready
    pub created_at: DateTime<Utc>,
    /// Connections currently attached to this session
    #[serde(default)]
    pub joined_connections: Vec<JoinRecord>,
    /// Bumped on every compare-and-set write
    #[serde(default)]
    pub version: u64,
}

impl SessionRecord {
    /// Create a record for a freshly opened primary session
    pub fn new(backend: &BackendAddr, connection_info: Option<Value>) -> Self {
        Self {
            backend_host: backend.host.clone(),
            backend_port: backend.port,
            connection_info,
            created_at: Utc::now(),
            joined_connections: Vec::new(),
            version: 0,
        }
    }

    /// Backend daemon address of this session
    pub fn backend(&self) -> BackendAddr {
        BackendAddr::new(self.backend_host.clone(), self.backend_port)
    }
}

/// A connection attached to another connection's session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRecord {
    /// Gateway-local ordinal of the joined connection
    pub connection_id: ConnectionId,
    /// Session id the backend assigned to the joined tunnel
    pub tunnel_session_id: SessionId,
    /// When the joined tunnel became ready
    pub joined_at: DateTime<Utc>,
    /// Settings supplied with the join
    #[serde(default)]
    pub join_settings: Map<String, Value>,
}

/// Result of a version-checked registry write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The record was replaced
    Written,
    /// The stored record changed since it was read
    Conflict,
    /// No record is stored under the id
    Missing,
}

/// Key/value store of session records shared by gateway instances
///
/// Every operation may involve network I/O and may fail independently;
/// callers treat failures as [`RegistryError::Unavailable`] and degrade.
#[async_trait]
pub trait SessionRegistry: Send + Sync {
    /// Fetch a session record
    async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, RegistryError>;

    /// Store a session record unconditionally
    async fn set(&self, id: &SessionId, record: SessionRecord) -> Result<(), RegistryError>;

    /// Remove a session record (absent ids are not an error)
    async fn delete(&self, id: &SessionId) -> Result<(), RegistryError>;

    /// Store `record` only if the stored version still equals `expected_version`.
    ///
    /// On success the stored record carries `expected_version + 1`.
    async fn compare_and_set(
        &self,
        id: &SessionId,
        expected_version: u64,
        record: SessionRecord,
    ) -> Result<CasOutcome, RegistryError>;
}
