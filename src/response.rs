//! Response records handed back to the host.

use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

/// Attached to every decision for downstream inspection. In dark mode an
/// admitted-but-over-budget query carries `success = false`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRecord {
    /// Milliseconds since the epoch at decision time.
    pub timestamp: u64,
    pub complexity: u64,
    pub tokens: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
}

/// JSON body of a 429 response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub error: String,
    pub retry_after_seconds: u64,
    pub record: AdmissionRecord,
}

impl RejectionBody {
    pub fn new(retry_after_ms: u64, record: AdmissionRecord) -> Self {
        Self {
            error: "rate limit exceeded".to_string(),
            retry_after_seconds: retry_after_ms.div_ceil(1000),
            record,
        }
    }
}

/// JSON body of 4xx/5xx error responses.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub errors: Vec<String>,
}

impl ErrorBody {
    pub fn new(errors: Vec<String>) -> Self {
        Self { errors }
    }
}

/// Wall-clock milliseconds since the epoch.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
