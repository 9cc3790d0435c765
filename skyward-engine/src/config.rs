//! Engine configuration.
//!
//! Everything the engine needs to know about its environment arrives through
//! [`EngineConfig`]; there is no process-wide client state.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::Backoff;
use crate::operation::PollPolicy;

pub const DEFAULT_ENDPOINT: &str = "https://management.azure.com";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid base endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(String),
}

/// Engine settings. Durations are stored in milliseconds so the struct
/// round-trips through JSON without a custom format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Control-plane base URL.
    pub base_endpoint: String,
    pub subscription_id: String,
    pub tenant_id: String,
    /// Client identifier, appended to the user agent.
    pub client_id: String,
    pub poll_interval_ms: u64,
    pub max_poll_interval_ms: u64,
    pub operation_timeout_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Ceiling for consecutive Conflict/Throttled outcomes before giving up.
    pub max_retries: u32,
    /// Concurrent reconciliation workers.
    pub workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_endpoint: DEFAULT_ENDPOINT.to_string(),
            subscription_id: String::new(),
            tenant_id: String::new(),
            client_id: "skyward".to_string(),
            poll_interval_ms: 5_000,
            max_poll_interval_ms: 60_000,
            operation_timeout_ms: 30 * 60 * 1_000,
            base_backoff_ms: 2_000,
            max_backoff_ms: 5 * 60 * 1_000,
            max_retries: 10,
            workers: 4,
        }
    }
}

impl EngineConfig {
    /// Check invariants the rest of the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.base_endpoint.starts_with("https://") || self.base_endpoint.starts_with("http://"))
        {
            return Err(ConfigError::InvalidEndpoint(self.base_endpoint.clone()));
        }
        if self.subscription_id.trim().is_empty() {
            return Err(ConfigError::Missing("subscription_id"));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                name: "workers",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "poll_interval_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.base_backoff_ms == 0 {
            return Err(ConfigError::Invalid {
                name: "base_backoff_ms",
                reason: "must be positive".to_string(),
            });
        }
        if self.operation_timeout_ms < self.poll_interval_ms {
            return Err(ConfigError::Invalid {
                name: "operation_timeout_ms",
                reason: format!("shorter than poll interval ({}ms)", self.poll_interval_ms),
            });
        }
        Ok(())
    }

    /// Base endpoint without a trailing slash.
    pub fn endpoint(&self) -> &str {
        self.base_endpoint.trim_end_matches('/')
    }

    pub fn user_agent(&self) -> String {
        format!("skyward/{} {}", env!("CARGO_PKG_VERSION"), self.client_id)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(self.poll_interval_ms),
            max_interval: Duration::from_millis(self.max_poll_interval_ms),
            timeout: Duration::from_millis(self.operation_timeout_ms),
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_backoff_ms),
            Duration::from_millis(self.max_backoff_ms),
        )
    }
}
