//! Redis-backed session registry
//!
//! Lets a session opened through one gateway replica be joined through
//! another. Records are stored as JSON strings under `<prefix><session id>`.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use tokio::sync::OnceCell;

use tg_core::config::RegistryConfig;
use tg_core::traits::{CasOutcome, SessionRecord, SessionRegistry};
use tg_core::{RegistryError, SessionId};

/// Replace the record only if its stored version matches ARGV[1].
/// Returns 1 written, 0 conflict, -1 missing, -2 unreadable record.
const COMPARE_AND_SET: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then
  return -1
end
local ok, decoded = pcall(cjson.decode, current)
if not ok then
  return -2
end
local version = tonumber(decoded['version']) or 0
if version ~= tonumber(ARGV[1]) then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// Session registry shared by gateway replicas through Redis
pub struct RedisRegistry {
    client: redis::Client,
    /// Established on first use so an unreachable store fails operations,
    /// not gateway startup
    connection: OnceCell<ConnectionManager>,
    key_prefix: String,
    op_timeout: Duration,
    cas_script: redis::Script,
}

impl RedisRegistry {
    /// Create a registry client; no connection is made until first use
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let client = redis::Client::open(config.redis_url.as_str())
            .map_err(|e| RegistryError::unavailable(format!("invalid Redis URL: {}", e)))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            key_prefix: config.key_prefix.clone(),
            op_timeout: config.op_timeout,
            cas_script: redis::Script::new(COMPARE_AND_SET),
        })
    }

    fn key(&self, id: &SessionId) -> String {
        format!("{}{}", self.key_prefix, id)
    }

    async fn connection(&self) -> Result<ConnectionManager, RegistryError> {
        let manager = self
            .connection
            .get_or_try_init(|| self.bounded("CONNECT", ConnectionManager::new(self.client.clone())))
            .await?;
        Ok(manager.clone())
    }

    /// Run one round trip, bounded by the configured timeout
    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T, RegistryError>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_connection_refusal() {
                    tracing::error!("Redis connection failed - sessions will not be shared across replicas");
                }
                Err(RegistryError::unavailable(format!("{} failed: {}", op, e)))
            }
            Err(_) => Err(RegistryError::unavailable(format!(
                "{} timed out after {:?}",
                op, self.op_timeout
            ))),
        }
    }

    fn encode(record: &SessionRecord) -> Result<String, RegistryError> {
        serde_json::to_string(record)
            .map_err(|e| RegistryError::unavailable(format!("record not serializable: {}", e)))
    }
}

#[async_trait]
impl SessionRegistry for RedisRegistry {
    async fn get(&self, id: &SessionId) -> Result<Option<SessionRecord>, RegistryError> {
        let mut conn = self.connection().await?;
        let key = self.key(id);
        let raw: Option<String> = self.bounded("GET", conn.get(&key)).await?;

        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|e| {
                RegistryError::unavailable(format!("stored record for {} is unreadable: {}", id, e))
            })
        })
        .transpose()
    }

    async fn set(&self, id: &SessionId, record: SessionRecord) -> Result<(), RegistryError> {
        let payload = Self::encode(&record)?;
        let mut conn = self.connection().await?;
        let key = self.key(id);
        let _: () = self.bounded("SET", conn.set(&key, payload)).await?;
        Ok(())
    }

    async fn delete(&self, id: &SessionId) -> Result<(), RegistryError> {
        let mut conn = self.connection().await?;
        let key = self.key(id);
        let _: () = self.bounded("DEL", conn.del(&key)).await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        id: &SessionId,
        expected_version: u64,
        mut record: SessionRecord,
    ) -> Result<CasOutcome, RegistryError> {
        record.version = expected_version + 1;
        let payload = Self::encode(&record)?;
        let mut conn = self.connection().await?;
        let key = self.key(id);

        let mut invocation = self.cas_script.prepare_invoke();
        invocation.key(&key).arg(expected_version).arg(payload);
        let code: i64 = self.bounded("CAS", invocation.invoke_async(&mut conn)).await?;

        match code {
            1 => Ok(CasOutcome::Written),
            0 => Ok(CasOutcome::Conflict),
            -1 => Ok(CasOutcome::Missing),
            _ => Err(RegistryError::unavailable(format!(
                "stored record for {} is unreadable",
                id
            ))),
        }
    }
}
