//! Core configuration
//!
//! JSON-based configuration with environment variable substitution. Option
//! names on the wire are camelCase; unspecified options fall back to the
//! defaults below. Caller-supplied request timeouts are clamped into
//! `[MIN_REQUEST_TIMEOUT_MS, request_timeout_ms_max]`.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{CoreError, Result};

/// Lower bound for a per-request deadline (1 s).
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;

/// Runtime tunables for the integration core.
///
/// Example file:
///     {
///       "maxConnections": 10,
///       "requestTimeoutMsDefault": 15000
///     }
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CoreConfig {
    /// Upper bound on live connections in the pool.
    pub max_connections: usize,

    /// Timeout for transport connect + handshake, per attempt.
    pub connection_timeout_ms: u64,

    /// Per-request deadline when the caller did not specify one.
    pub request_timeout_ms_default: u64,

    /// Hard upper bound; larger caller values are clamped down.
    pub request_timeout_ms_max: u64,

    /// Health probe period.
    pub health_interval_ms: u64,

    /// Auto-discovery period.
    pub discovery_interval_ms: u64,

    /// Idle connection TTL; non-leased connections untouched this long are evicted.
    pub idle_evict_ms: u64,

    /// Connect retry attempts before an acquire fails.
    pub max_retries: u32,

    /// Delay between connect retries.
    pub retry_delay_ms: u64,

    /// Sweeper threshold for executions stuck in `running`.
    pub execution_stuck_ms: u64,

    /// Bounded buffer size for event emission (drop-oldest on overflow).
    pub event_sink_buffer: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            connection_timeout_ms: 30_000,
            request_timeout_ms_default: 30_000,
            request_timeout_ms_max: 600_000,
            health_interval_ms: 60_000,
            discovery_interval_ms: 900_000,
            idle_evict_ms: 1_800_000,
            max_retries: 3,
            retry_delay_ms: 1_000,
            execution_stuck_ms: 300_000,
            event_sink_buffer: 1_024,
        }
    }
}

impl CoreConfig {
    /// Load configuration from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CoreConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the runtime cannot operate with.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(CoreError::Validation(
                "maxConnections must be at least 1".to_string(),
            ));
        }
        if self.request_timeout_ms_default < MIN_REQUEST_TIMEOUT_MS {
            return Err(CoreError::Validation(format!(
                "requestTimeoutMsDefault must be at least {} ms",
                MIN_REQUEST_TIMEOUT_MS
            )));
        }
        if self.request_timeout_ms_max < self.request_timeout_ms_default {
            return Err(CoreError::Validation(
                "requestTimeoutMsMax must not be below requestTimeoutMsDefault".to_string(),
            ));
        }
        Ok(())
    }

    /// Effective per-request deadline for a caller-supplied value.
    ///
    /// Missing values use the default; values above the hard upper bound
    /// are clamped down, not rejected. Sub-second values are honored as
    /// given so short deadlines stay observable.
    pub fn clamp_request_timeout(&self, requested_ms: Option<u64>) -> u64 {
        requested_ms
            .unwrap_or(self.request_timeout_ms_default)
            .min(self.request_timeout_ms_max)
            .max(1)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Resolve an environment variable reference of the form `${VAR_NAME}`.
///
/// Values not wrapped in `${...}` pass through unchanged. A missing variable
/// is a validation error naming the variable.
pub fn resolve_env_var(value: &str) -> Result<String> {
    if value.starts_with("${") && value.ends_with('}') {
        let var_name = &value[2..value.len() - 1];
        std::env::var(var_name).map_err(|_| {
            CoreError::Validation(format!("environment variable not found: {}", var_name))
        })
    } else {
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_match_documented_table() {
        let config = CoreConfig::default();
        assert_eq!(config.max_connections, 50);
        assert_eq!(config.connection_timeout_ms, 30_000);
        assert_eq!(config.request_timeout_ms_default, 30_000);
        assert_eq!(config.request_timeout_ms_max, 600_000);
        assert_eq!(config.health_interval_ms, 60_000);
        assert_eq!(config.discovery_interval_ms, 900_000);
        assert_eq!(config.idle_evict_ms, 1_800_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.retry_delay_ms, 1_000);
        assert_eq!(config.execution_stuck_ms, 300_000);
        assert_eq!(config.event_sink_buffer, 1_024);
    }

    #[test]
    fn test_timeout_clamping() {
        let config = CoreConfig::default();
        assert_eq!(config.clamp_request_timeout(None), 30_000);
        assert_eq!(config.clamp_request_timeout(Some(200)), 200);
        assert_eq!(config.clamp_request_timeout(Some(0)), 1);
        assert_eq!(config.clamp_request_timeout(Some(5_000)), 5_000);
        assert_eq!(config.clamp_request_timeout(Some(10_000_000)), 600_000);
    }

    #[test]
    fn test_load_partial_file_uses_defaults() {
        let mut temp = NamedTempFile::new().unwrap();
        temp.write_all(br#"{"maxConnections": 2, "requestTimeoutMsDefault": 5000}"#)
            .unwrap();
        temp.flush().unwrap();

        let config = CoreConfig::load_from_file(temp.path()).unwrap();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.request_timeout_ms_default, 5_000);
        assert_eq!(config.health_interval_ms, 60_000);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = CoreConfig {
            max_connections: 0,
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());

        let config = CoreConfig {
            request_timeout_ms_max: 10_000,
            request_timeout_ms_default: 20_000,
            ..CoreConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_var_resolution() {
        env::set_var("MCP_CORE_TEST_VAR", "resolved");

        assert_eq!(resolve_env_var("${MCP_CORE_TEST_VAR}").unwrap(), "resolved");
        assert_eq!(resolve_env_var("literal").unwrap(), "literal");

        env::remove_var("MCP_CORE_TEST_VAR");
    }

    #[test]
    fn test_missing_env_var() {
        let result = resolve_env_var("${MCP_CORE_NO_SUCH_VAR_93514}");
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("environment variable not found"));
    }
}
