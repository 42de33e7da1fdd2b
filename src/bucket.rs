//! Token bucket over a counter store.
//!
//! The bucket itself is stateless: capacity, refill rate and TTL travel with
//! every call, and the store executes the read-refill-consume-write cycle
//! atomically. Refill is lazy, computed from the elapsed time since the
//! row's last update.

use crate::error::{GateError, GateResult};
use crate::store::CounterStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Parameters carried into every admission transaction.
#[derive(Debug, Clone, Copy)]
pub struct BucketParams {
    pub capacity: u64,
    /// Tokens restored per second.
    pub refill_rate: f64,
    /// TTL applied to the bucket row on every write.
    pub key_expiry_ms: u64,
}

/// Outcome of one admission.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Admission {
    pub success: bool,
    /// Tokens remaining after the call (unchanged on rejection).
    pub tokens: f64,
    /// How long until enough tokens exist for this cost, on rejection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

pub struct TokenBucket<S> {
    store: Arc<S>,
    params: BucketParams,
}

impl<S: CounterStore> TokenBucket<S> {
    pub fn new(
        store: Arc<S>,
        capacity: u64,
        refill_rate: f64,
        key_expiry_ms: u64,
    ) -> GateResult<Self> {
        if capacity == 0 {
            return Err(GateError::Config("bucket capacity must be greater than 0".to_string()));
        }
        if !(refill_rate > 0.0) || !refill_rate.is_finite() {
            return Err(GateError::Config("refill rate must be a positive number".to_string()));
        }
        if key_expiry_ms == 0 {
            return Err(GateError::Config("key expiry must be greater than 0".to_string()));
        }

        Ok(Self { store, params: BucketParams { capacity, refill_rate, key_expiry_ms } })
    }

    pub fn params(&self) -> &BucketParams {
        &self.params
    }

    /// Run one admission for `client_id` at `now_ms`, charging `cost` tokens.
    pub async fn admit(
        &self,
        client_id: &str,
        now_ms: u64,
        cost: u64,
    ) -> GateResult<Admission> {
        let key = bucket_key(client_id);
        let admission = self.store.admit(&key, now_ms, cost, &self.params).await?;
        debug!(
            client_id,
            cost,
            success = admission.success,
            tokens = admission.tokens,
            "admission decided"
        );
        Ok(admission)
    }
}

/// Namespaced, store-safe key for a client's bucket row.
pub fn bucket_key(client_id: &str) -> String {
    let sanitized: String = client_id
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ':' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("gqlgate:{}", sanitized)
}

/// The bucket arithmetic: refill from elapsed time, clamp to capacity, then
/// consume or compute the backoff. `state` is the stored `(tokens, lastRefill)`
/// pair, absent on a client's first admission. Returns the admission and the
/// row to write back.
pub fn refill_and_consume(
    state: Option<(f64, u64)>,
    now_ms: u64,
    cost: u64,
    params: &BucketParams,
) -> (Admission, (f64, u64)) {
    let (stored_tokens, last_refill_ms) = state.unwrap_or((params.capacity as f64, now_ms));

    let elapsed_ms = now_ms.saturating_sub(last_refill_ms);
    let refilled = stored_tokens + params.refill_rate * elapsed_ms as f64 / 1000.0;
    let mut tokens = refilled.min(params.capacity as f64);

    let cost = cost as f64;
    let admission = if tokens >= cost {
        tokens -= cost;
        Admission { success: true, tokens, retry_after_ms: None }
    } else {
        let retry_after_ms = ((cost - tokens) * 1000.0 / params.refill_rate).ceil() as u64;
        Admission { success: false, tokens, retry_after_ms: Some(retry_after_ms) }
    };

    (admission, (tokens, now_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;

    fn bucket(capacity: u64, refill_rate: f64) -> TokenBucket<MemoryCounterStore> {
        TokenBucket::new(Arc::new(MemoryCounterStore::new()), capacity, refill_rate, 86_400_000)
            .unwrap()
    }

    #[tokio::test]
    async fn test_admit_then_reject_with_backoff() {
        let bucket = bucket(10, 1.0);

        let first = bucket.admit("client", 0, 6).await.unwrap();
        assert!(first.success);
        assert_eq!(first.tokens, 4.0);

        let second = bucket.admit("client", 0, 6).await.unwrap();
        assert!(!second.success);
        assert_eq!(second.tokens, 4.0);
        assert_eq!(second.retry_after_ms, Some(2_000));
    }

    #[tokio::test]
    async fn test_refill_restores_tokens() {
        let bucket = bucket(10, 1.0);
        bucket.admit("client", 0, 6).await.unwrap();

        // 3 seconds later the bucket holds 7 tokens again.
        let third = bucket.admit("client", 3_000, 6).await.unwrap();
        assert!(third.success);
        assert_eq!(third.tokens, 1.0);
    }

    #[tokio::test]
    async fn test_refill_clamps_at_capacity() {
        let bucket = bucket(10, 1.0);
        bucket.admit("client", 0, 10).await.unwrap();

        // A long idle period never overfills the bucket.
        let admission = bucket.admit("client", 3_600_000, 10).await.unwrap();
        assert!(admission.success);
        assert_eq!(admission.tokens, 0.0);
    }

    #[tokio::test]
    async fn test_tokens_never_go_negative() {
        let bucket = bucket(5, 1.0);
        let admission = bucket.admit("client", 0, 8).await.unwrap();
        assert!(!admission.success);
        assert!(admission.tokens >= 0.0);
        assert_eq!(admission.retry_after_ms, Some(3_000));
    }

    #[tokio::test]
    async fn test_zero_cost_always_admits() {
        let bucket = bucket(1, 1.0);
        bucket.admit("client", 0, 1).await.unwrap();
        let free = bucket.admit("client", 0, 0).await.unwrap();
        assert!(free.success);
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let result = TokenBucket::new(Arc::new(MemoryCounterStore::new()), 0, 1.0, 1_000);
        assert!(matches!(result, Err(GateError::Config(_))));
    }

    #[test]
    fn test_rejects_non_positive_refill_rate() {
        let result = TokenBucket::new(Arc::new(MemoryCounterStore::new()), 10, 0.0, 1_000);
        assert!(matches!(result, Err(GateError::Config(_))));
    }

    #[test]
    fn test_bucket_key_is_namespaced_and_sanitized() {
        assert_eq!(bucket_key("10.0.0.1"), "gqlgate:10.0.0.1");
        assert_eq!(bucket_key("bad key\n"), "gqlgate:bad_key_");
    }
}
