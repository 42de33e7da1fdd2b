//! Counter store adapters.
//!
//! The bucket talks to a shared key/value store through [`CounterStore`].
//! The Redis adapter runs the whole read-refill-consume-write cycle as one
//! server-side script, so concurrent processes never interleave inside an
//! admission. The in-memory adapter runs the same arithmetic under a mutex
//! and backs tests and single-process deployments.

use crate::bucket::{refill_and_consume, Admission, BucketParams};
use crate::error::{GateError, GateResult};
use async_trait::async_trait;
use redis::{aio::MultiplexedConnection, Client, RedisError, Script};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// One atomic admission per call, per the wire protocol
/// `(key, nowMs, cost, capacity, refillRate, keyExpiryMs)` →
/// `(success, remainingTokens, retryAfterMs?)`.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn admit(
        &self,
        key: &str,
        now_ms: u64,
        cost: u64,
        params: &BucketParams,
    ) -> GateResult<Admission>;

    async fn ping(&self) -> GateResult<()>;
}

/// Lua mirror of [`refill_and_consume`]. Executed atomically by Redis;
/// tokens travel as strings because Lua number replies truncate to integers.
const ADMISSION_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local cost = tonumber(ARGV[2])
local capacity = tonumber(ARGV[3])
local refill_rate = tonumber(ARGV[4])

local tokens = capacity
local last = now
local state = redis.call('HMGET', KEYS[1], 'tokens', 'lastRefill')
if state[1] then
    tokens = tonumber(state[1])
    last = tonumber(state[2]) or now
end

local elapsed = now - last
if elapsed < 0 then
    elapsed = 0
end
tokens = math.min(capacity, tokens + refill_rate * elapsed / 1000)

local success = 0
local retry = -1
if tokens >= cost then
    tokens = tokens - cost
    success = 1
else
    retry = math.ceil((cost - tokens) * 1000 / refill_rate)
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens), 'lastRefill', ARGV[1])
redis.call('PEXPIRE', KEYS[1], ARGV[5])
return {success, tostring(tokens), retry}
"#;

pub struct RedisCounterStore {
    client: Client,
    script: Script,
    connection_timeout: Duration,
}

impl RedisCounterStore {
    pub fn new(redis_url: &str) -> GateResult<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            GateError::Config(format!("failed to create redis client: {}", e))
        })?;

        info!(url = redis_url, "redis counter store created");

        Ok(Self {
            client,
            script: Script::new(ADMISSION_SCRIPT),
            connection_timeout: Duration::from_secs(5),
        })
    }

    pub fn with_timeout(mut self, connection_timeout: Duration) -> Self {
        self.connection_timeout = connection_timeout;
        self
    }

    async fn connection(&self) -> GateResult<MultiplexedConnection> {
        timeout(
            self.connection_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| GateError::StoreUnavailable("connection timeout".to_string()))?
        .map_err(|e| self.handle_redis_error(e, "connect"))
    }

    fn handle_redis_error(&self, error: RedisError, operation: &str) -> GateError {
        match error.kind() {
            redis::ErrorKind::IoError => {
                warn!(operation, %error, "redis connection lost");
                GateError::StoreUnavailable(format!("connection lost during {}", operation))
            }
            redis::ErrorKind::AuthenticationFailed => {
                error!(operation, %error, "redis authentication failed");
                GateError::Store("authentication failed".to_string())
            }
            _ => {
                error!(operation, %error, "redis error");
                GateError::Store(format!("redis error during {}: {}", operation, error))
            }
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn admit(
        &self,
        key: &str,
        now_ms: u64,
        cost: u64,
        params: &BucketParams,
    ) -> GateResult<Admission> {
        let mut conn = self.connection().await?;

        let mut invocation = self.script.key(key);
        invocation
            .arg(now_ms)
            .arg(cost)
            .arg(params.capacity)
            .arg(params.refill_rate)
            .arg(params.key_expiry_ms);

        let (success, tokens, retry_after_ms): (u8, String, i64) =
            timeout(self.connection_timeout, invocation.invoke_async(&mut conn))
                .await
                .map_err(|_| {
                    GateError::StoreUnavailable("admission script timeout".to_string())
                })?
                .map_err(|e| self.handle_redis_error(e, "admit"))?;

        let tokens = tokens.parse::<f64>().map_err(|_| {
            GateError::Store(format!("invalid token count in script reply: {}", tokens))
        })?;

        debug!(key, cost, success, tokens, "admission script executed");

        Ok(Admission {
            success: success == 1,
            tokens,
            retry_after_ms: (retry_after_ms >= 0).then_some(retry_after_ms as u64),
        })
    }

    async fn ping(&self) -> GateResult<()> {
        let mut conn = self.connection().await?;
        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| self.handle_redis_error(e, "ping"))?;

        if response == "PONG" {
            debug!("redis ping successful");
            Ok(())
        } else {
            Err(GateError::Store("unexpected ping response".to_string()))
        }
    }
}

/// Process-local store. Rows expire lazily against the configured TTL.
#[derive(Default)]
pub struct MemoryCounterStore {
    rows: Mutex<HashMap<String, BucketRow>>,
}

#[derive(Clone, Copy)]
struct BucketRow {
    tokens: f64,
    last_refill_ms: u64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn admit(
        &self,
        key: &str,
        now_ms: u64,
        cost: u64,
        params: &BucketParams,
    ) -> GateResult<Admission> {
        let mut rows = self
            .rows
            .lock()
            .map_err(|_| GateError::Store("failed to acquire bucket lock".to_string()))?;

        let state = rows
            .get(key)
            .copied()
            .filter(|row| now_ms.saturating_sub(row.last_refill_ms) < params.key_expiry_ms)
            .map(|row| (row.tokens, row.last_refill_ms));

        let (admission, (tokens, last_refill_ms)) =
            refill_and_consume(state, now_ms, cost, params);
        rows.insert(key.to_string(), BucketRow { tokens, last_refill_ms });

        Ok(admission)
    }

    async fn ping(&self) -> GateResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BucketParams {
        BucketParams { capacity: 10, refill_rate: 1.0, key_expiry_ms: 86_400_000 }
    }

    #[tokio::test]
    async fn test_memory_store_initializes_full() {
        let store = MemoryCounterStore::new();
        let admission = store.admit("gqlgate:a", 0, 4, &params()).await.unwrap();
        assert!(admission.success);
        assert_eq!(admission.tokens, 6.0);
    }

    #[tokio::test]
    async fn test_memory_store_expires_rows_lazily() {
        let store = MemoryCounterStore::new();
        let p = BucketParams { key_expiry_ms: 1_000, ..params() };
        store.admit("gqlgate:a", 0, 10, &p).await.unwrap();

        // Past the TTL the row resets to a full bucket.
        let admission = store.admit("gqlgate:a", 2_000, 10, &p).await.unwrap();
        assert!(admission.success);
        assert_eq!(admission.tokens, 0.0);
    }

    #[tokio::test]
    async fn test_memory_store_ping_is_always_healthy() {
        assert!(MemoryCounterStore::new().ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_store_isolates_keys() {
        let store = MemoryCounterStore::new();
        store.admit("gqlgate:a", 0, 10, &params()).await.unwrap();
        let other = store.admit("gqlgate:b", 0, 1, &params()).await.unwrap();
        assert!(other.success);
        assert_eq!(other.tokens, 9.0);
    }
}
