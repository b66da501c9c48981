//! In-process session registry

use async_trait::async_trait;
use dashmap::DashMap;

use tg_core::traits::{CasOutcome, SessionRecord, SessionRegistry};
use tg_core::{RegistryError, SessionId};

/// Session registry for single-instance deployments
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    /// Records indexed by session ID
    sessions: DashMap<SessionId, SessionRecord>,
}

impl MemoryRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Number of stored sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionRegistry for MemoryRegistry {
    async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, RegistryError> {
        Ok(self.sessions.get(id).map(|r| r.value().clone()))
    }

    async fn set(&self, id: &SessionId, record: SessionRecord) -> Result<(), RegistryError> {
        self.sessions.insert(id.clone(), record);
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<(), RegistryError> {
        self.sessions.remove(id);
        Ok(())
    }

    async fn compare_and_set(
        &self,
        id: &SessionId,
        expected_version: u64,
        mut record: SessionRecord,
    ) -> Result<CasOutcome, RegistryError> {
        // get_mut holds the shard write lock across the check and the write
        let outcome = match self.sessions.get_mut(id) {
            None => CasOutcome::Missing,
            Some(current) if current.version != expected_version => CasOutcome::Conflict,
            Some(mut current) => {
                record.version = expected_version + 1;
                *current = record;
                CasOutcome::Written
            }
        };
        Ok(outcome)
    }
}
