//! # Controller Configuration
//!
//! Reconciliation tuning loaded from environment variables.

use super::env_var_or_default;
use crate::constants::{
    DEFAULT_CONFLICT_RETRY_FACTOR, DEFAULT_CONFLICT_RETRY_INITIAL_MS, DEFAULT_CONFLICT_RETRY_STEPS,
    DEFAULT_ERROR_BACKOFF_MAX_SECS, DEFAULT_ERROR_BACKOFF_MIN_SECS, DEFAULT_HOOK_TIMEOUT_SECS,
};
use crate::dynamic::RetryPolicy;
use std::time::Duration;

/// Controller configuration
///
/// All settings have sensible defaults and can be overridden via environment variables.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Upper bound for a single decision-function call (seconds)
    pub hook_timeout_secs: u64,
    /// Attempts made by a read-modify-write before giving up on conflicts
    pub conflict_retry_steps: u32,
    /// First delay between conflicting read-modify-write attempts (milliseconds)
    pub conflict_retry_initial_ms: u64,
    /// Multiplier applied to the delay after each conflict
    pub conflict_retry_factor: u32,
    /// Smallest requeue delay after a failed reconciliation (seconds)
    pub error_backoff_min_secs: u64,
    /// Largest requeue delay after repeated failures (seconds)
    pub error_backoff_max_secs: u64,
    /// Only watch parents and children in this namespace when set
    pub watch_namespace: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            hook_timeout_secs: DEFAULT_HOOK_TIMEOUT_SECS,
            conflict_retry_steps: DEFAULT_CONFLICT_RETRY_STEPS,
            conflict_retry_initial_ms: DEFAULT_CONFLICT_RETRY_INITIAL_MS,
            conflict_retry_factor: DEFAULT_CONFLICT_RETRY_FACTOR,
            error_backoff_min_secs: DEFAULT_ERROR_BACKOFF_MIN_SECS,
            error_backoff_max_secs: DEFAULT_ERROR_BACKOFF_MAX_SECS,
            watch_namespace: None,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        Self {
            hook_timeout_secs: env_var_or_default("HOOK_TIMEOUT_SECS", DEFAULT_HOOK_TIMEOUT_SECS),
            conflict_retry_steps: env_var_or_default(
                "CONFLICT_RETRY_STEPS",
                DEFAULT_CONFLICT_RETRY_STEPS,
            ),
            conflict_retry_initial_ms: env_var_or_default(
                "CONFLICT_RETRY_INITIAL_MS",
                DEFAULT_CONFLICT_RETRY_INITIAL_MS,
            ),
            conflict_retry_factor: env_var_or_default(
                "CONFLICT_RETRY_FACTOR",
                DEFAULT_CONFLICT_RETRY_FACTOR,
            ),
            error_backoff_min_secs: env_var_or_default(
                "ERROR_BACKOFF_MIN_SECS",
                DEFAULT_ERROR_BACKOFF_MIN_SECS,
            ),
            error_backoff_max_secs: env_var_or_default(
                "ERROR_BACKOFF_MAX_SECS",
                DEFAULT_ERROR_BACKOFF_MAX_SECS,
            ),
            watch_namespace: std::env::var("WATCH_NAMESPACE")
                .ok()
                .filter(|ns| !ns.is_empty()),
        }
    }

    /// Decision-function timeout
    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_secs)
    }

    /// Retry policy for optimistic-concurrency writes
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            steps: self.conflict_retry_steps.max(1),
            initial: Duration::from_millis(self.conflict_retry_initial_ms),
            factor: self.conflict_retry_factor.max(1),
        }
    }
}
