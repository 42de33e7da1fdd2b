//! Complexity-aware rate limiting gate for GraphQL services.
//!
//! Before the host executes a query, the gate costs it against a weight
//! table derived from the schema, then charges a distributed token bucket
//! keyed by client identity. Queries are admitted, shadow-admitted (dark
//! mode), or rejected with a backoff signal. Admissions for one client are
//! serialized FIFO so counter updates never interleave.

pub mod analyzer;
pub mod bucket;
pub mod config;
pub mod error;
pub mod gate;
pub mod middleware;
pub mod response;
pub mod serializer;
pub mod store;
pub mod weights;

pub use bucket::{Admission, BucketParams, TokenBucket};
pub use config::GateConfig;
pub use error::{GateError, GateResult};
pub use gate::{client_identity, Gate, GateDecision, GateRequest};
pub use response::AdmissionRecord;
pub use serializer::ClientSerializer;
pub use store::{CounterStore, MemoryCounterStore, RedisCounterStore};
pub use weights::WeightTable;
