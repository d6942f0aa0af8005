use serde::Deserialize;
use std::time::Duration;

use crate::env::{env_flag_with, env_parse_with};

/// Budgets an execution runtime enforces inside one run.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SandboxLimits {
    /// Wall-clock budget for one run in milliseconds
    pub exec_timeout_ms: u64,
    /// V8 heap ceiling per context
    pub isolate_memory_limit_mb: u64,
    pub max_fetches_per_exec: u32,
    pub max_fetch_bytes_total: u64,
    pub max_fetch_bytes_per_response: u64,
    pub fetch_timeout_ms: u64,
    pub max_log_bytes_per_exec: u64,
    pub max_result_bytes: usize,
    pub max_result_depth: usize,
    /// Refuse loopback/private/link-local destinations
    pub deny_private_networks: bool,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            exec_timeout_ms: 2_000,
            isolate_memory_limit_mb: 128,
            max_fetches_per_exec: 10,
            max_fetch_bytes_total: 2_000_000,
            max_fetch_bytes_per_response: 1_000_000,
            fetch_timeout_ms: 2_000,
            max_log_bytes_per_exec: 16_000,
            max_result_bytes: 256_000,
            max_result_depth: 20,
            deny_private_networks: true,
        }
    }
}

impl SandboxLimits {
    /// Overlay environment values on top of `self`.
    ///
    /// Environment variables:
    /// - EXEC_TIMEOUT_MS, ISOLATE_MEMORY_LIMIT_MB
    /// - MAX_FETCHES_PER_EXEC, MAX_FETCH_BYTES_TOTAL, MAX_FETCH_BYTES_PER_RESPONSE, FETCH_TIMEOUT_MS
    /// - MAX_LOG_BYTES_PER_EXEC, MAX_RESULT_BYTES, MAX_RESULT_DEPTH
    /// - DENY_PRIVATE_NETWORKS
    pub fn with_env<F>(self, env_get: &F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        Self {
            exec_timeout_ms: env_parse_with("EXEC_TIMEOUT_MS", self.exec_timeout_ms, env_get),
            isolate_memory_limit_mb: env_parse_with(
                "ISOLATE_MEMORY_LIMIT_MB",
                self.isolate_memory_limit_mb,
                env_get,
            ),
            max_fetches_per_exec: env_parse_with(
                "MAX_FETCHES_PER_EXEC",
                self.max_fetches_per_exec,
                env_get,
            ),
            max_fetch_bytes_total: env_parse_with(
                "MAX_FETCH_BYTES_TOTAL",
                self.max_fetch_bytes_total,
                env_get,
            ),
            max_fetch_bytes_per_response: env_parse_with(
                "MAX_FETCH_BYTES_PER_RESPONSE",
                self.max_fetch_bytes_per_response,
                env_get,
            ),
            fetch_timeout_ms: env_parse_with("FETCH_TIMEOUT_MS", self.fetch_timeout_ms, env_get),
            max_log_bytes_per_exec: env_parse_with(
                "MAX_LOG_BYTES_PER_EXEC",
                self.max_log_bytes_per_exec,
                env_get,
            ),
            max_result_bytes: env_parse_with("MAX_RESULT_BYTES", self.max_result_bytes, env_get),
            max_result_depth: env_parse_with("MAX_RESULT_DEPTH", self.max_result_depth, env_get),
            deny_private_networks: env_flag_with(
                "DENY_PRIVATE_NETWORKS",
                self.deny_private_networks,
                env_get,
            ),
        }
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn heap_limit_bytes(&self) -> usize {
        (self.isolate_memory_limit_mb as usize).saturating_mul(1024 * 1024)
    }
}
