//! Error handling for the gate.

use std::fmt;

/// Errors that can occur while building or operating the gate.
#[derive(Debug, Clone)]
pub enum GateError {
    /// Configuration rejected at setup (bad value, unimplemented limiter)
    Config(String),
    /// Schema rejected while building the weight table
    Schema(String),
    /// Query failed to parse; carries the parser's error list
    Query(Vec<String>),
    /// Query nests deeper than the configured limit
    DepthLimitExceeded { depth: u32, limit: u32 },
    /// Structural error while costing a query (unknown type/field, bad
    /// slicing value, arithmetic overflow)
    Analysis(String),
    /// Counter store rejected the operation
    Store(String),
    /// Counter store could not be reached (timeout, connection loss)
    StoreUnavailable(String),
}

pub type GateResult<T> = Result<T, GateError>;

impl fmt::Display for GateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateError::Config(msg) => write!(f, "Configuration error: {}", msg),
            GateError::Schema(msg) => write!(f, "Schema error: {}", msg),
            GateError::Query(errors) => write!(f, "Invalid query: {}", errors.join("; ")),
            GateError::DepthLimitExceeded { depth, limit } => {
                write!(f, "Query depth {} exceeds the limit of {}", depth, limit)
            }
            GateError::Analysis(msg) => write!(f, "Complexity analysis error: {}", msg),
            GateError::Store(msg) => write!(f, "Counter store error: {}", msg),
            GateError::StoreUnavailable(msg) => {
                write!(f, "Counter store unavailable: {}", msg)
            }
        }
    }
}

impl std::error::Error for GateError {}

impl From<redis::RedisError> for GateError {
    fn from(error: redis::RedisError) -> Self {
        match error.kind() {
            redis::ErrorKind::IoError => GateError::StoreUnavailable(error.to_string()),
            _ => GateError::Store(error.to_string()),
        }
    }
}
