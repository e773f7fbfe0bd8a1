//! Configuration types for talking to x402 facilitators.
//!
//! [`FacilitatorConfig`] describes one remote facilitator: where it lives, how to
//! authorize against it, per-operation timeouts and the transport retry budget.
//! It deserializes from JSON with defaults for everything but the URL:
//!
//! ```json
//! {
//!   "url": "https://facilitator.example/",
//!   "authorization": "${FACILITATOR_TOKEN}",
//!   "verifyTimeout": 5000,
//!   "settleTimeout": 60000,
//!   "retry": { "maxAttempts": 3 }
//! }
//! ```
//!
//! # Environment Variable Resolution
//!
//! [`LiteralOrEnv`] lets secrets be given either literally or as `$VAR` / `${VAR}`,
//! so they stay out of configuration files.

use serde::{Deserialize, Serialize};
use std::ops::Deref;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::util::RetryPolicy;

/// Retry settings as they appear in configuration files.
pub type RetryConfig = RetryPolicy;

/// Connection settings for a single remote facilitator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorConfig {
    /// Base URL; `verify`, `settle` and `supported` are resolved relative to it.
    pub url: Url,
    /// Static `Authorization` header value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<LiteralOrEnv<String>>,
    #[serde(default = "config_defaults::verify_timeout", with = "duration_millis")]
    pub verify_timeout: Duration,
    #[serde(default = "config_defaults::settle_timeout", with = "duration_millis")]
    pub settle_timeout: Duration,
    #[serde(default = "config_defaults::supported_timeout", with = "duration_millis")]
    pub supported_timeout: Duration,
    /// Retry budget for transport-level failures.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl FacilitatorConfig {
    /// Configuration with default timeouts and no retries.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            authorization: None,
            verify_timeout: config_defaults::verify_timeout(),
            settle_timeout: config_defaults::settle_timeout(),
            supported_timeout: config_defaults::supported_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

mod config_defaults {
    use std::time::Duration;

    pub const DEFAULT_VERIFY_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(60);
    pub const DEFAULT_SUPPORTED_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn verify_timeout() -> Duration {
        DEFAULT_VERIFY_TIMEOUT
    }

    pub fn settle_timeout() -> Duration {
        DEFAULT_SETTLE_TIMEOUT
    }

    pub fn supported_timeout() -> Duration {
        DEFAULT_SUPPORTED_TIMEOUT
    }
}

pub use config_defaults::{
    DEFAULT_SETTLE_TIMEOUT, DEFAULT_SUPPORTED_TIMEOUT, DEFAULT_VERIFY_TIMEOUT,
};

/// Serde adapter for [`Duration`] as integer milliseconds.
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// ============================================================================
// Environment Variable Resolution
// ============================================================================

/// A transparent wrapper that resolves environment variables during deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"Bearer abc"`
/// - Simple env var: `"$FACILITATOR_TOKEN"`
/// - Braced env var: `"${FACILITATOR_TOKEN}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn from_literal(value: T) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    /// Returns the variable name if `s` is `$VAR` or `${VAR}`.
    fn parse_env_var_syntax(s: &str) -> Option<&str> {
        if let Some(braced) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
            return Some(braced);
        }
        let name = s.strip_prefix('$')?;
        let valid = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
        valid.then_some(name)
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = match Self::parse_env_var_syntax(&s) {
            Some(var_name) => std::env::var(var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{var_name}' not found (referenced as '{s}')"
                ))
            })?,
            None => s,
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {e}")))?;
        Ok(LiteralOrEnv(parsed))
    }
}

impl<T: Serialize> Serialize for LiteralOrEnv<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}
