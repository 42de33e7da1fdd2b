//! Gate orchestration.
//!
//! Per request: parse, depth-check, cost, then run the admission through the
//! per-client serializer and the token bucket. The weight table is built
//! once at construction and shared immutably across requests.

use crate::analyzer;
use crate::bucket::TokenBucket;
use crate::config::GateConfig;
use crate::error::{GateError, GateResult};
use crate::response::{epoch_ms, AdmissionRecord};
use crate::serializer::ClientSerializer;
use crate::store::CounterStore;
use crate::weights::WeightTable;
use async_graphql::parser::types::ServiceDocument;
use async_graphql::parser::{parse_query, parse_schema};
use async_graphql::Variables;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Gate<S> {
    table: WeightTable,
    bucket: TokenBucket<S>,
    serializer: ClientSerializer,
    dark: bool,
    depth_limit: Option<u32>,
}

impl<S> std::fmt::Debug for Gate<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gate")
            .field("dark", &self.dark)
            .field("depth_limit", &self.depth_limit)
            .finish_non_exhaustive()
    }
}

/// One admission request from the host.
#[derive(Debug, Clone)]
pub struct GateRequest {
    pub query: String,
    pub variables: Variables,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub enum GateDecision {
    Admit(AdmissionRecord),
    Reject { retry_after_ms: u64, record: AdmissionRecord },
}

impl GateDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, GateDecision::Admit(_))
    }

    pub fn record(&self) -> &AdmissionRecord {
        match self {
            GateDecision::Admit(record) => record,
            GateDecision::Reject { record, .. } => record,
        }
    }
}

impl<S: CounterStore> Gate<S> {
    /// Build a gate from SDL text.
    pub fn new(schema_sdl: &str, config: &GateConfig, store: Arc<S>) -> GateResult<Self> {
        let schema =
            parse_schema(schema_sdl).map_err(|e| GateError::Schema(e.to_string()))?;
        Self::from_schema(&schema, config, store)
    }

    /// Build a gate from an already-parsed schema.
    pub fn from_schema(
        schema: &ServiceDocument,
        config: &GateConfig,
        store: Arc<S>,
    ) -> GateResult<Self> {
        config.validate()?;
        let (capacity, refill_rate) = config.bucket_params()?;
        let table = WeightTable::build(schema, config)?;
        let bucket = TokenBucket::new(store, capacity, refill_rate, config.redis.key_expiry_ms)?;

        info!(
            types = table.len(),
            capacity,
            refill_rate,
            dark = config.dark,
            "gate initialized"
        );

        Ok(Self {
            table,
            bucket,
            serializer: ClientSerializer::new(),
            dark: config.dark,
            depth_limit: config.depth_limit,
        })
    }

    pub fn weight_table(&self) -> &WeightTable {
        &self.table
    }

    /// Decide one request. Store errors propagate to the caller; the
    /// client's queue advances on every terminal outcome.
    pub async fn handle(&self, request: &GateRequest) -> GateResult<GateDecision> {
        let document = parse_query(&request.query)
            .map_err(|e| GateError::Query(vec![e.to_string()]))?;

        let depth = analyzer::depth(&document);
        if let Some(limit) = self.depth_limit {
            if depth > limit {
                return Err(GateError::DepthLimitExceeded { depth, limit });
            }
        }

        let complexity = analyzer::analyze(&document, &request.variables, &self.table)?;
        let timestamp = epoch_ms();

        let turn = self.serializer.acquire(&request.client_id).await;
        let outcome = self
            .bucket
            .admit(&request.client_id, timestamp, complexity)
            .await;
        drop(turn);
        let admission = outcome?;

        let record = AdmissionRecord {
            timestamp,
            complexity,
            tokens: admission.tokens,
            success: admission.success,
            depth: Some(depth),
        };

        if admission.success {
            debug!(
                client_id = %request.client_id,
                complexity,
                tokens = admission.tokens,
                "query admitted"
            );
            Ok(GateDecision::Admit(record))
        } else if self.dark {
            warn!(
                client_id = %request.client_id,
                complexity,
                tokens = admission.tokens,
                "rejection suppressed in dark mode"
            );
            Ok(GateDecision::Admit(record))
        } else {
            info!(
                client_id = %request.client_id,
                complexity,
                retry_after_ms = admission.retry_after_ms.unwrap_or(0),
                "query rejected"
            );
            Ok(GateDecision::Reject {
                retry_after_ms: admission.retry_after_ms.unwrap_or(0),
                record,
            })
        }
    }
}

/// Stable identity for the requester: the first proxied address when the
/// request came through a proxy, else the direct peer address.
pub fn client_identity(forwarded_for: Option<&str>, remote_addr: &str) -> String {
    forwarded_for
        .and_then(|xff| xff.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or(remote_addr)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCounterStore;
    use serde_json::json;

    const SDL: &str = r#"
        type Query {
            scalars: Scalars
            human(id: ID!): Human
        }
        type Scalars {
            id: ID
            num: Int
        }
        type Human {
            name: String
            friends(first: Int): [Human]
        }
    "#;

    fn gate(config: GateConfig) -> Gate<MemoryCounterStore> {
        Gate::new(SDL, &config, Arc::new(MemoryCounterStore::new())).unwrap()
    }

    fn config(bucket_size: u64) -> GateConfig {
        GateConfig::from_json(json!({
            "rateLimiter": { "type": "TOKEN_BUCKET", "bucketSize": bucket_size, "refillRate": 0.001 }
        }))
        .unwrap()
    }

    fn request(query: &str) -> GateRequest {
        GateRequest {
            query: query.to_string(),
            variables: Variables::default(),
            client_id: "10.0.0.1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_admits_until_budget_is_spent() {
        let gate = gate(config(3));
        let request = request("query { scalars { num } }");

        let first = gate.handle(&request).await.unwrap();
        assert!(first.is_admitted());
        assert_eq!(first.record().complexity, 2);

        let second = gate.handle(&request).await.unwrap();
        let GateDecision::Reject { retry_after_ms, record } = second else {
            panic!("expected a rejection");
        };
        assert!(!record.success);
        assert!(retry_after_ms > 0);
    }

    #[tokio::test]
    async fn test_dark_mode_admits_but_marks_failure() {
        let mut config = config(3);
        config.dark = true;
        let gate = gate(config);
        let request = request("query { scalars { num } }");

        gate.handle(&request).await.unwrap();
        let shadowed = gate.handle(&request).await.unwrap();
        assert!(shadowed.is_admitted());
        assert!(!shadowed.record().success);
    }

    #[tokio::test]
    async fn test_depth_limit_rejects_deep_queries() {
        let mut config = config(100);
        config.depth_limit = Some(2);
        let gate = gate(config);
        let request =
            request("query { human(id: 1) { friends(first: 2) { name } } }");

        let err = gate.handle(&request).await.unwrap_err();
        assert!(matches!(err, GateError::DepthLimitExceeded { depth: 3, limit: 2 }));
    }

    #[tokio::test]
    async fn test_parse_failure_is_a_query_error() {
        let gate = gate(config(100));
        let err = gate.handle(&request("query {")).await.unwrap_err();
        assert!(matches!(err, GateError::Query(_)));
    }

    #[tokio::test]
    async fn test_record_carries_depth_and_timestamp() {
        let gate = gate(config(100));
        let decision = gate.handle(&request("query { scalars { num } }")).await.unwrap();
        let record = decision.record();
        assert_eq!(record.depth, Some(2));
        assert!(record.timestamp > 0);
    }

    #[test]
    fn test_client_identity_prefers_first_proxied_address() {
        assert_eq!(
            client_identity(Some("203.0.113.9, 10.0.0.1"), "192.168.0.7"),
            "203.0.113.9"
        );
        assert_eq!(client_identity(Some("  "), "192.168.0.7"), "192.168.0.7");
        assert_eq!(client_identity(None, "192.168.0.7"), "192.168.0.7");
    }

    #[test]
    fn test_unimplemented_limiter_fails_at_setup() {
        let config = GateConfig {
            rate_limiter: crate::config::RateLimiterConfig::LeakyBucket,
            ..GateConfig::default()
        };
        let err = Gate::new(SDL, &config, Arc::new(MemoryCounterStore::new())).unwrap_err();
        assert!(matches!(err, GateError::Config(_)));
    }
}
