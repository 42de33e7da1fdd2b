//! Gate configuration.
//!
//! The configuration document mirrors what a host would ship as camelCase
//! JSON; every key is optional and merges over the defaults below. Setup
//! fails fast on values the gate cannot run with, including rate-limiter
//! variants that are recognized but not implemented.

use crate::error::{GateError, GateResult};
use serde::{Deserialize, Serialize};
use std::env;

pub const DEFAULT_MUTATION_WEIGHT: u64 = 10;
pub const DEFAULT_OBJECT_WEIGHT: u64 = 1;
pub const DEFAULT_SCALAR_WEIGHT: u64 = 0;
pub const DEFAULT_CONNECTION_WEIGHT: u64 = 2;

/// Bucket rows expire after a day of inactivity unless configured otherwise.
pub const DEFAULT_KEY_EXPIRY_MS: u64 = 86_400_000;

const DEFAULT_BUCKET_SIZE: u64 = 100;
const DEFAULT_REFILL_RATE: f64 = 10.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GateConfig {
    pub rate_limiter: RateLimiterConfig,
    pub type_weights: TypeWeightConfig,
    pub redis: RedisConfig,
    /// Compute and log rejections but admit every query.
    pub dark: bool,
    /// Fail the weight-table build on list fields with no slicing argument.
    pub enforce_bounded_lists: bool,
    /// Maximum query nesting; `None` leaves depth unbounded.
    pub depth_limit: Option<u32>,
    /// Argument names that bound the cardinality of a list field.
    pub slicing_arguments: Vec<String>,
    /// Multiplier assumed for list fields with no resolvable bound.
    pub default_list_size: u64,
}

/// Rate limiter selection. Only the token bucket is implemented; the other
/// tags deserialize so existing host configuration parses, and then fail
/// validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RateLimiterConfig {
    #[serde(rename = "TOKEN_BUCKET", rename_all = "camelCase")]
    TokenBucket { bucket_size: u64, refill_rate: f64 },
    #[serde(rename = "LEAKY_BUCKET")]
    LeakyBucket,
    #[serde(rename = "FIXED_WINDOW")]
    FixedWindow,
    #[serde(rename = "SLIDING_WINDOW_LOG")]
    SlidingWindowLog,
    #[serde(rename = "SLIDING_WINDOW_COUNTER")]
    SlidingWindowCounter,
}

impl RateLimiterConfig {
    fn tag(&self) -> &'static str {
        match self {
            RateLimiterConfig::TokenBucket { .. } => "TOKEN_BUCKET",
            RateLimiterConfig::LeakyBucket => "LEAKY_BUCKET",
            RateLimiterConfig::FixedWindow => "FIXED_WINDOW",
            RateLimiterConfig::SlidingWindowLog => "SLIDING_WINDOW_LOG",
            RateLimiterConfig::SlidingWindowCounter => "SLIDING_WINDOW_COUNTER",
        }
    }
}

/// Base weights per type kind, merged over `{10, 1, 0, 2}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TypeWeightConfig {
    pub mutation: u64,
    pub object: u64,
    pub scalar: u64,
    pub connection: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedisConfig {
    /// Connection URL; redis options (db index, auth, TLS) ride in the URL.
    pub url: String,
    /// Per-key TTL in milliseconds, applied on every write.
    #[serde(rename = "keyExpiry")]
    pub key_expiry_ms: u64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            rate_limiter: RateLimiterConfig::TokenBucket {
                bucket_size: DEFAULT_BUCKET_SIZE,
                refill_rate: DEFAULT_REFILL_RATE,
            },
            type_weights: TypeWeightConfig::default(),
            redis: RedisConfig::default(),
            dark: false,
            enforce_bounded_lists: false,
            depth_limit: None,
            slicing_arguments: vec![
                "first".to_string(),
                "last".to_string(),
                "limit".to_string(),
            ],
            default_list_size: 1,
        }
    }
}

impl Default for TypeWeightConfig {
    fn default() -> Self {
        Self {
            mutation: DEFAULT_MUTATION_WEIGHT,
            object: DEFAULT_OBJECT_WEIGHT,
            scalar: DEFAULT_SCALAR_WEIGHT,
            connection: DEFAULT_CONNECTION_WEIGHT,
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_expiry_ms: DEFAULT_KEY_EXPIRY_MS,
        }
    }
}

impl GateConfig {
    /// Parse a configuration document, merging over defaults.
    pub fn from_json(value: serde_json::Value) -> GateResult<Self> {
        let config: GateConfig = serde_json::from_value(value)
            .map_err(|e| GateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load overrides from the environment on top of the defaults.
    pub fn from_env() -> GateResult<Self> {
        let mut config = Self::default();

        if let Ok(url) = env::var("REDIS_URL") {
            config.redis.url = url;
        }

        if let Ok(expiry) = env::var("GQLGATE_KEY_EXPIRY_MS") {
            config.redis.key_expiry_ms = expiry
                .parse()
                .map_err(|_| GateError::Config(format!("invalid key expiry: {}", expiry)))?;
        }

        let mut bucket_size = DEFAULT_BUCKET_SIZE;
        let mut refill_rate = DEFAULT_REFILL_RATE;
        if let Ok(size) = env::var("GQLGATE_BUCKET_SIZE") {
            bucket_size = size
                .parse()
                .map_err(|_| GateError::Config(format!("invalid bucket size: {}", size)))?;
        }
        if let Ok(rate) = env::var("GQLGATE_REFILL_RATE") {
            refill_rate = rate
                .parse()
                .map_err(|_| GateError::Config(format!("invalid refill rate: {}", rate)))?;
        }
        config.rate_limiter = RateLimiterConfig::TokenBucket { bucket_size, refill_rate };

        if let Ok(dark) = env::var("GQLGATE_DARK") {
            config.dark = matches!(dark.as_str(), "1" | "true" | "yes");
        }

        if let Ok(depth) = env::var("GQLGATE_DEPTH_LIMIT") {
            config.depth_limit = Some(
                depth
                    .parse()
                    .map_err(|_| GateError::Config(format!("invalid depth limit: {}", depth)))?,
            );
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GateResult<()> {
        match self.rate_limiter {
            RateLimiterConfig::TokenBucket { bucket_size, refill_rate } => {
                if bucket_size == 0 {
                    return Err(GateError::Config(
                        "bucketSize must be greater than 0".to_string(),
                    ));
                }
                if !(refill_rate > 0.0) || !refill_rate.is_finite() {
                    return Err(GateError::Config(
                        "refillRate must be a positive number".to_string(),
                    ));
                }
            }
            ref other => {
                return Err(GateError::Config(format!(
                    "{} rate limiter is recognized but not implemented",
                    other.tag()
                )));
            }
        }

        if self.redis.key_expiry_ms == 0 {
            return Err(GateError::Config(
                "redis.keyExpiry must be greater than 0".to_string(),
            ));
        }

        if self.depth_limit == Some(0) {
            return Err(GateError::Config(
                "depthLimit must be greater than 0".to_string(),
            ));
        }

        if self.slicing_arguments.is_empty() {
            return Err(GateError::Config(
                "slicingArguments must name at least one argument".to_string(),
            ));
        }

        Ok(())
    }

    /// The token bucket's `(capacity, refillRate)`, once validated.
    pub fn bucket_params(&self) -> GateResult<(u64, f64)> {
        match self.rate_limiter {
            RateLimiterConfig::TokenBucket { bucket_size, refill_rate } => {
                Ok((bucket_size, refill_rate))
            }
            ref other => Err(GateError::Config(format!(
                "{} rate limiter is recognized but not implemented",
                other.tag()
            ))),
        }
    }
}
