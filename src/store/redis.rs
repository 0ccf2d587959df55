//! Redis store backend
//!
//! Thin mapping of the [`Store`] contract onto Redis commands, with
//! bounded exponential-backoff retry on transient (network) failures.
//! Advisory locks are `SET NX PX` with a holder token; release goes
//! through a small Lua script so only the owning token can unlock.

use async_trait::async_trait;
use redis::AsyncCommands;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::{Fields, Store, StoreError, StoreResult};

/// Base delay for the retry backoff: 100ms, 200ms, 400ms, ...
const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Token-checked lock release. Deleting unconditionally would let a slow
/// holder clobber a lock that already expired and was re-acquired.
const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

pub struct RedisStore {
    client: redis::Client,
    max_retries: u32,
}

impl RedisStore {
    /// Create a store client for `url` (e.g. `redis://127.0.0.1:6379`).
    /// Connections are established lazily per command.
    pub fn connect(url: &str, max_retries: u32) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Fatal(format!("invalid redis url {url}: {e}")))?;
        Ok(RedisStore {
            client,
            max_retries,
        })
    }

    /// Run `op` with retry on transient failures; everything else is
    /// returned immediately.
    async fn retry<T, F, Fut>(&self, what: &str, op: F) -> StoreResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                debug!("retrying {what} after {}ms", delay.as_millis());
                tokio::time::sleep(delay).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(StoreError::Transient(msg)) => {
                    warn!(
                        "{what} failed (attempt {}/{}): {msg}",
                        attempt + 1,
                        self.max_retries + 1
                    );
                    last_error = Some(StoreError::Transient(msg));
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_error
            .unwrap_or_else(|| StoreError::Transient(format!("{what}: retries exhausted"))))
    }
}

fn map_redis_err(e: redis::RedisError) -> StoreError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_refusal() || e.is_connection_dropped()
    {
        StoreError::Transient(e.to_string())
    } else {
        StoreError::Fatal(e.to_string())
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn ping(&self) -> StoreResult<()> {
        self.retry("PING", || {
            let client = self.client.clone();
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                redis::cmd("PING")
                    .query_async::<_, String>(&mut con)
                    .await
                    .map(|_| ())
                    .map_err(map_redis_err)
            }
        })
        .await
    }

    async fn hget_all(&self, key: &str) -> StoreResult<Fields> {
        self.retry("HGETALL", || {
            let client = self.client.clone();
            let key = key.to_string();
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                con.hgetall::<_, Fields>(&key).await.map_err(map_redis_err)
            }
        })
        .await
    }

    async fn hset(&self, key: &str, fields: &[(&str, String)]) -> StoreResult<()> {
        let owned: Vec<(String, String)> = fields
            .iter()
            .map(|(f, v)| (f.to_string(), v.clone()))
            .collect();

        self.retry("HSET", || {
            let client = self.client.clone();
            let key = key.to_string();
            let fields = owned.clone();
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                con.hset_multiple::<_, _, _, ()>(&key, &fields)
                    .await
                    .map_err(map_redis_err)
            }
        })
        .await
    }

    async fn hincr(&self, key: &str, field: &str, delta: f64) -> StoreResult<f64> {
        self.retry("HINCRBYFLOAT", || {
            let client = self.client.clone();
            let key = key.to_string();
            let field = field.to_string();
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                con.hincr::<_, _, _, f64>(&key, &field, delta)
                    .await
                    .map_err(map_redis_err)
            }
        })
        .await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.retry("INCR", || {
            let client = self.client.clone();
            let key = key.to_string();
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                con.incr::<_, _, i64>(&key, 1i64).await.map_err(map_redis_err)
            }
        })
        .await
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.retry("KEYS", || {
            let client = self.client.clone();
            let pattern = format!("{prefix}*");
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                con.keys::<_, Vec<String>>(&pattern)
                    .await
                    .map_err(map_redis_err)
            }
        })
        .await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.retry("DEL", || {
            let client = self.client.clone();
            let key = key.to_string();
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                con.del::<_, ()>(&key).await.map_err(map_redis_err)
            }
        })
        .await
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<()> {
        self.retry("SADD", || {
            let client = self.client.clone();
            let key = key.to_string();
            let member = member.to_string();
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                con.sadd::<_, _, ()>(&key, &member)
                    .await
                    .map_err(map_redis_err)
            }
        })
        .await
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<()> {
        self.retry("SREM", || {
            let client = self.client.clone();
            let key = key.to_string();
            let member = member.to_string();
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                con.srem::<_, _, ()>(&key, &member)
                    .await
                    .map_err(map_redis_err)
            }
        })
        .await
    }

    async fn smembers(&self, key: &str) -> StoreResult<Vec<String>> {
        self.retry("SMEMBERS", || {
            let client = self.client.clone();
            let key = key.to_string();
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                con.smembers::<_, Vec<String>>(&key)
                    .await
                    .map_err(map_redis_err)
            }
        })
        .await
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let ttl_ms = ttl.as_millis().max(1) as u64;

        self.retry("SET NX", || {
            let client = self.client.clone();
            let key = key.to_string();
            let token = token.to_string();
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                let reply: Option<String> = redis::cmd("SET")
                    .arg(&key)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_ms)
                    .query_async(&mut con)
                    .await
                    .map_err(map_redis_err)?;
                if reply.is_some() {
                    return Ok(true);
                }
                // NX refused: either someone else holds it, or we do (then
                // refresh the TTL instead of failing).
                let holder: Option<String> =
                    con.get(&key).await.map_err(map_redis_err)?;
                if holder.as_deref() == Some(token.as_str()) {
                    redis::cmd("PEXPIRE")
                        .arg(&key)
                        .arg(ttl_ms)
                        .query_async::<_, ()>(&mut con)
                        .await
                        .map_err(map_redis_err)?;
                    return Ok(true);
                }
                Ok(false)
            }
        })
        .await
    }

    async fn unlock(&self, key: &str, token: &str) -> StoreResult<()> {
        self.retry("release lock", || {
            let client = self.client.clone();
            let key = key.to_string();
            let token = token.to_string();
            async move {
                let mut con = client
                    .get_async_connection()
                    .await
                    .map_err(map_redis_err)?;
                redis::Script::new(RELEASE_LOCK_SCRIPT)
                    .key(&key)
                    .arg(&token)
                    .invoke_async::<_, i64>(&mut con)
                    .await
                    .map(|_| ())
                    .map_err(map_redis_err)
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::ErrorKind;

    #[test]
    fn test_error_mapping() {
        let io: redis::RedisError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "down").into();
        assert!(matches!(map_redis_err(io), StoreError::Transient(_)));

        let type_err = redis::RedisError::from((ErrorKind::TypeError, "bad reply"));
        assert!(matches!(map_redis_err(type_err), StoreError::Fatal(_)));
    }

    #[test]
    fn test_rejects_bad_url() {
        assert!(RedisStore::connect("not a url", 3).is_err());
    }
}
