//! One-time token enforcement
//!
//! Every admitted token is recorded by the SHA-256 of its raw value, so the
//! table never holds a usable token. Records are kept for a retention
//! horizon and then removed by a periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use tg_core::time::{current_time_millis, secs_between};
use tg_core::TokenError;

/// Record of consumed tokens keyed by token hash
pub struct ReplayGuard {
    /// Hex SHA-256 of the raw token -> consumption time (unix millis)
    used: DashMap<String, u64>,
    /// How long a record is kept
    retention: Duration,
}

impl ReplayGuard {
    /// Create a guard that remembers tokens for `retention`
    pub fn new(retention: Duration) -> Self {
        Self {
            used: DashMap::new(),
            retention,
        }
    }

    fn hash(token: &str) -> String {
        hex::encode(Sha256::digest(token.as_bytes()))
    }

    /// Mark a token as used, failing if it was already used.
    ///
    /// The existence check and insertion happen under one shard lock, so
    /// of any number of concurrent callers with the same token exactly one
    /// succeeds.
    pub fn validate_and_mark(&self, token: &str) -> Result<(), TokenError> {
        self.validate_and_mark_at(token, current_time_millis())
    }

    fn validate_and_mark_at(&self, token: &str, now: u64) -> Result<(), TokenError> {
        // The shard lock must be released before len() walks every shard
        let previous = match self.used.entry(Self::hash(token)) {
            Entry::Occupied(entry) => Some(*entry.get()),
            Entry::Vacant(entry) => {
                entry.insert(now);
                None
            }
        };

        match previous {
            Some(used_at) => {
                let used_secs_ago = secs_between(used_at, now);
                tracing::warn!("Token already used {} seconds ago", used_secs_ago);
                Err(TokenError::Replay { used_secs_ago })
            }
            None => {
                tracing::debug!("Token marked as used. Total used tokens: {}", self.used.len());
                Ok(())
            }
        }
    }

    /// Remove records older than the retention horizon; returns how many
    pub fn sweep(&self) -> usize {
        self.sweep_at(current_time_millis())
    }

    fn sweep_at(&self, now: u64) -> usize {
        let retention = self.retention.as_millis() as u64;
        let before = self.used.len();
        self.used
            .retain(|_, used_at| now.saturating_sub(*used_at) <= retention);
        before.saturating_sub(self.used.len())
    }

    /// Number of tokens currently remembered
    pub fn len(&self) -> usize {
        self.used.len()
    }

    /// Check if no tokens are remembered
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Retention horizon
    pub fn retention(&self) -> Duration {
        self.retention
    }
}

/// Run the used-token sweep until cancelled.
///
/// # Arguments
///
/// * `guard` - The replay guard to sweep
/// * `interval` - Time between sweeps
/// * `cancel` - Cancellation token for shutdown
pub async fn run_token_sweep(
    guard: Arc<ReplayGuard>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately and there is nothing to sweep yet
    ticker.tick().await;

    tracing::info!(
        "Starting token sweep task (retention: {:?}, interval: {:?})",
        guard.retention(),
        interval
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let cleaned = guard.sweep();
                if cleaned > 0 {
                    tracing::debug!(
                        "Cleaned up {} old tokens. Current count: {}",
                        cleaned,
                        guard.len()
                    );
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Token sweep task shutting down");
                break;
            }
        }
    }
}
