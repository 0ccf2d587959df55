//! In-memory store backend
//!
//! Implements the full [`Store`] contract over process-local maps. Used by
//! the test suite and by `--memory` runs; lock semantics (token + TTL)
//! match the Redis backend so engine behaviour is identical.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

use super::{Fields, Store, StoreResult};

#[derive(Default)]
pub struct MemoryStore {
    hashes: Mutex<HashMap<String, Fields>>,
    sets: Mutex<HashMap<String, BTreeSet<String>>>,
    counters: Mutex<HashMap<String, i64>>,
    locks: Mutex<HashMap<String, LockEntry>>,
}

struct LockEntry {
    token: String,
    expires_at: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> StoreResult<Fields> {
        let hashes = self.hashes.lock().unwrap();
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let mut hashes = self.hashes.lock().unwrap();
        let entry = hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            entry.insert(field.to_string(), value.clone());
        }
        Ok(())
    }

    async fn hincr(&self, key: &str, field: &str, delta: f64) -> StoreResult<f64> {
        let mut hashes = self.hashes.lock().unwrap();
        let entry = hashes.entry(key.to_string()).or_default();
        let current = entry
            .get(field)
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(0.0);
        let next = current + delta;
        entry.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut counters = self.counters.lock().unwrap();
        let entry = counters.entry(key.to_string()).or_insert(0);
        *entry += 1;
        Ok(*entry)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let hashes = self.hashes.lock().unwrap();
        let sets = self.sets.lock().unwrap();
        let counters = self.counters.lock().unwrap();
        let mut keys: Vec<String> = hashes
            .keys()
            .chain(sets.keys())
            .chain(counters.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.hashes.lock().unwrap().remove(key);
        self.sets.lock().unwrap().remove(key);
        self.counters.lock().unwrap().remove(key);
        self.locks.lock().unwrap().remove(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        self.sets
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        if let Some(set) = self.sets.lock().unwrap().get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        let sets = self.sets.lock().unwrap();
        Ok(sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let mut locks = self.locks.lock().unwrap();
        let now = Instant::now();

        if let Some(entry) = locks.get(key) {
            if entry.expires_at > now && entry.token != token {
                return Ok(false);
            }
        }
        locks.insert(
            key.to_string(),
            LockEntry {
                token: token.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> StoreResult<()> {
        let mut locks = self.locks.lock().unwrap();
        if locks.get(key).is_some_and(|entry| entry.token == token) {
            locks.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_round_trip() {
        let store = MemoryStore::new();
        store
            .hset("bal_BTC", &[("free", "1.5".to_string()), ("used", "0".to_string())])
            .await
            .unwrap();

        let fields = store.hget_all("bal_BTC").await.unwrap();
        assert_eq!(fields.get("free").map(String::as_str), Some("1.5"));
        assert!(store.hget_all("bal_ETH").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_hincr_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.hincr("bal_BTC", "free", 1.25).await.unwrap(), 1.25);
        assert_eq!(store.hincr("bal_BTC", "free", 0.75).await.unwrap(), 2.0);
        assert_eq!(store.hincr("bal_BTC", "free", -2.0).await.unwrap(), 0.0);
    }

    #[tokio::test]
    async fn test_incr_is_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("seq_order").await.unwrap(), 1);
        assert_eq!(store.incr("seq_order").await.unwrap(), 2);
        assert_eq!(store.incr("seq_order").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_keys_with_prefix() {
        let store = MemoryStore::new();
        store.hset("sym_BTC/USDT", &[("price", "1".to_string())]).await.unwrap();
        store.hset("sym_ETH/USDT", &[("price", "1".to_string())]).await.unwrap();
        store.hset("bal_BTC", &[("free", "1".to_string())]).await.unwrap();

        let keys = store.keys_with_prefix("sym_").await.unwrap();
        assert_eq!(keys, vec!["sym_BTC/USDT", "sym_ETH/USDT"]);
    }

    #[tokio::test]
    async fn test_sets() {
        let store = MemoryStore::new();
        store.sadd("idx_status_new", "ord-1").await.unwrap();
        store.sadd("idx_status_new", "ord-2").await.unwrap();
        store.sadd("idx_status_new", "ord-1").await.unwrap();

        assert_eq!(
            store.smembers("idx_status_new").await.unwrap(),
            vec!["ord-1", "ord-2"]
        );

        store.srem("idx_status_new", "ord-1").await.unwrap();
        assert_eq!(store.smembers("idx_status_new").await.unwrap(), vec!["ord-2"]);
        assert!(store.smembers("idx_status_filled").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_clears_everything() {
        let store = MemoryStore::new();
        store.hset("ord_x", &[("status", "new".to_string())]).await.unwrap();
        store.delete("ord_x").await.unwrap();
        assert!(store.hget_all("ord_x").await.unwrap().is_empty());
    }
}
