//! Store adapter: typed access to the key-value store
//!
//! The engine keeps no authoritative in-memory state; everything lives in
//! hashes, sets and counters behind this trait. Two backends are provided:
//! [`RedisStore`] for deployments and [`MemoryStore`] for tests and local
//! runs. Mutual exclusion is advisory: per-key locks taken with a token and
//! a TTL, so a crashed holder can never wedge the system.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Hash field map as stored (both field names and values are strings).
pub type Fields = HashMap<String, String>;

/// Interval between lock acquisition attempts.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// How long an acquire will poll before giving up with `Conflict`.
const LOCK_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    /// Lost an optimistic race (e.g. a lock could not be acquired in time).
    #[error("conflict on {0}")]
    Conflict(String),

    /// Store unavailable; retried with bounded backoff inside the adapter.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// Unexpected reply shape or other non-retryable failure.
    #[error("fatal store failure: {0}")]
    Fatal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Typed operations the engine needs from the key-value store.
///
/// `keys_with_prefix` may be slow on large keyspaces and is only called
/// from background scans and admin commands.
#[async_trait]
pub trait Store: Send + Sync {
    /// Liveness probe.
    async fn ping(&self) -> StoreResult<()>;

    /// Read a whole hash; an absent key yields an empty map.
    async fn hget_all(&self, key: &str) -> StoreResult<Fields>;

    /// Write (upsert) hash fields.
    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()>;

    /// Atomically add `delta` to a numeric hash field, returning the new
    /// value. Missing fields start at zero.
    async fn hincr(&self, key: &str, field: &str, delta: f64) -> StoreResult<f64>;

    /// Atomically increment a plain counter key, returning the new value.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()>;

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Try to take the advisory lock `key` with the given holder token and
    /// TTL. Returns `false` when another holder owns it. Re-acquiring with
    /// the same token refreshes the TTL.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Release the advisory lock if (and only if) `token` still owns it.
    async fn unlock(&self, key: &str, token: &str) -> StoreResult<()>;
}

/// Held advisory lock on one store key.
///
/// Release is explicit; a guard dropped on an error path is reclaimed by
/// its TTL. Callers must not hold a lock across anything slower than the
/// TTL they asked for.
#[must_use = "a KeyLock must be released (or it only expires with its TTL)"]
pub struct KeyLock {
    store: Arc<dyn Store>,
    key: String,
    token: String,
    released: bool,
}

impl KeyLock {
    /// Poll `try_lock` until the lock is taken or [`LOCK_ACQUIRE_TIMEOUT`]
    /// elapses (then `Conflict`).
    pub async fn acquire(store: &Arc<dyn Store>, key: &str, ttl: Duration) -> StoreResult<KeyLock> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + LOCK_ACQUIRE_TIMEOUT;

        loop {
            if store.try_lock(key, &token, ttl).await? {
                return Ok(KeyLock {
                    store: Arc::clone(store),
                    key: key.to_string(),
                    token,
                    released: false,
                });
            }
            if Instant::now() >= deadline {
                return Err(StoreError::Conflict(key.to_string()));
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn release(mut self) -> StoreResult<()> {
        self.released = true;
        self.store.unlock(&self.key, &self.token).await
    }

    /// Release variant for tail positions: logs instead of propagating, so
    /// it never masks the primary result of the locked section.
    pub async fn release_or_warn(self) {
        let key = self.key.clone();
        if let Err(e) = self.release().await {
            warn!(key = %key, error = %e, "failed to release lock; TTL will reclaim it");
        }
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        if !self.released {
            // Cannot release asynchronously from Drop; the TTL reclaims it.
            warn!(key = %self.key, "lock guard dropped without release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_key_lock_excludes_second_holder() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let lock = KeyLock::acquire(&store, "lock_test", Duration::from_secs(5))
            .await
            .unwrap();

        assert!(!store
            .try_lock("lock_test", "other-token", Duration::from_secs(5))
            .await
            .unwrap());

        lock.release().await.unwrap();
        assert!(store
            .try_lock("lock_test", "other-token", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_key_lock_ttl_expiry() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        assert!(store
            .try_lock("lock_ttl", "a", Duration::from_millis(20))
            .await
            .unwrap());
        assert!(!store
            .try_lock("lock_ttl", "b", Duration::from_millis(20))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store
            .try_lock("lock_ttl", "b", Duration::from_millis(20))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unlock_requires_matching_token() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        assert!(store
            .try_lock("lock_tok", "owner", Duration::from_secs(5))
            .await
            .unwrap());

        // Wrong token is a no-op; the owner still holds the lock.
        store.unlock("lock_tok", "intruder").await.unwrap();
        assert!(!store
            .try_lock("lock_tok", "intruder", Duration::from_secs(5))
            .await
            .unwrap());

        store.unlock("lock_tok", "owner").await.unwrap();
        assert!(store
            .try_lock("lock_tok", "intruder", Duration::from_secs(5))
            .await
            .unwrap());
    }
}
