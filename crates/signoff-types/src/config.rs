//! Policy configuration consumed by the kernel components.
//!
//! These structs carry only plain policy values (intervals, budgets,
//! capacities). Loading them from the environment, including the signing
//! key, is the infrastructure layer's job.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Event bus delivery policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Retries after the first failed delivery attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub backoff_initial: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_multiplier: f64,
    /// Bound of each subscriber's queue; publishers block when full.
    pub queue_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_initial: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            queue_capacity: 256,
        }
    }
}

/// Timeout manager policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Interval between scans.
    pub scan_interval: Duration,
    /// Maximum approvals expired per tick.
    pub batch_size: u32,
    /// Base delay for workflow-level retry backoff.
    pub retry_backoff_initial: Duration,
    /// Multiplier for workflow-level retry backoff.
    pub retry_backoff_multiplier: f64,
    /// When false, workflows failed by a task handler are terminal
    /// immediately instead of consuming retry slots.
    pub task_failure_consumes_retry: bool,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(10),
            batch_size: 100,
            retry_backoff_initial: Duration::from_secs(5),
            retry_backoff_multiplier: 2.0,
            task_failure_consumes_retry: true,
        }
    }
}

/// Executor and approval-issuance policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Expiry applied when a request does not specify `timeout_seconds`.
    pub default_timeout_seconds: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 3600,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_defaults_match_documented_policy() {
        let config = BusConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.backoff_initial, Duration::from_millis(100));
        assert_eq!(config.queue_capacity, 256);
    }

    #[test]
    fn timeout_defaults() {
        let config = TimeoutConfig::default();
        assert_eq!(config.scan_interval, Duration::from_secs(10));
        assert_eq!(config.batch_size, 100);
        assert!(config.task_failure_consumes_retry);
    }

    #[test]
    fn approval_default_timeout_is_one_hour() {
        assert_eq!(ApprovalConfig::default().default_timeout_seconds, 3600);
    }
}
