//! Environment configuration for the orchestrator.
//!
//! All knobs come from the environment (a `.env` file is honored via
//! dotenvy in the server binary). Malformed values log a warning and fall
//! back to the default rather than refusing to start; the one deliberately
//! absent-able value is `SIGNING_KEY`, whose absence switches every token
//! and inbound-signature verification to fail closed.

use std::time::Duration;

use secrecy::SecretString;

use signoff_types::config::{ApprovalConfig, BusConfig, TimeoutConfig};

use crate::sqlite::pool::PoolSettings;

/// Fully resolved orchestrator configuration.
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub database_url: String,
    /// SQLite pool tunables (busy timeout, reader cap).
    pub pool: PoolSettings,
    /// Absent means all verification fails closed.
    pub signing_key: Option<SecretString>,
    pub bus: BusConfig,
    pub timeout: TimeoutConfig,
    pub approval: ApprovalConfig,
    /// Default retry budget for new workflows.
    pub max_workflow_retries: u32,
}

impl OrchestratorConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary lookup function (tests inject a map here
    /// instead of mutating the process environment).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let database_url = lookup("DATABASE_URL")
            .unwrap_or_else(|| "sqlite://signoff.db?mode=rwc".to_string());

        let pool_defaults = PoolSettings::default();
        let pool = PoolSettings {
            busy_timeout: Duration::from_millis(parse_or(
                &lookup,
                "DATABASE_BUSY_TIMEOUT_MS",
                pool_defaults.busy_timeout.as_millis() as u64,
            )),
            max_readers: parse_or(&lookup, "DATABASE_MAX_READERS", pool_defaults.max_readers),
        };

        let signing_key = match lookup("SIGNING_KEY") {
            Some(key) if !key.is_empty() => Some(SecretString::from(key)),
            _ => {
                tracing::warn!(
                    "SIGNING_KEY is not set; every callback token and inbound \
                     signature will fail verification"
                );
                None
            }
        };

        let bus_defaults = BusConfig::default();
        let bus = BusConfig {
            max_retries: parse_or(&lookup, "EVENT_BUS_MAX_RETRIES", bus_defaults.max_retries),
            backoff_initial: Duration::from_millis(parse_or(
                &lookup,
                "EVENT_BUS_BACKOFF_INITIAL",
                bus_defaults.backoff_initial.as_millis() as u64,
            )),
            backoff_multiplier: parse_or(
                &lookup,
                "EVENT_BUS_BACKOFF_MULTIPLIER",
                bus_defaults.backoff_multiplier,
            ),
            queue_capacity: parse_or(
                &lookup,
                "EVENT_BUS_QUEUE_CAPACITY",
                bus_defaults.queue_capacity,
            ),
        };

        let timeout_defaults = TimeoutConfig::default();
        let timeout = TimeoutConfig {
            scan_interval: Duration::from_secs(parse_or(
                &lookup,
                "TIMEOUT_SCAN_INTERVAL_SECONDS",
                timeout_defaults.scan_interval.as_secs(),
            )),
            batch_size: parse_or(
                &lookup,
                "TIMEOUT_SCAN_BATCH_SIZE",
                timeout_defaults.batch_size,
            ),
            retry_backoff_initial: Duration::from_secs(parse_or(
                &lookup,
                "WORKFLOW_RETRY_BACKOFF_SECONDS",
                timeout_defaults.retry_backoff_initial.as_secs(),
            )),
            retry_backoff_multiplier: timeout_defaults.retry_backoff_multiplier,
            task_failure_consumes_retry: parse_or(
                &lookup,
                "TASK_FAILURE_CONSUMES_RETRY",
                timeout_defaults.task_failure_consumes_retry,
            ),
        };

        let approval = ApprovalConfig {
            default_timeout_seconds: parse_or(
                &lookup,
                "DEFAULT_APPROVAL_TIMEOUT_SECONDS",
                ApprovalConfig::default().default_timeout_seconds,
            ),
        };

        Self {
            database_url,
            pool,
            signing_key,
            bus,
            timeout,
            approval,
            max_workflow_retries: parse_or(&lookup, "MAX_WORKFLOW_RETRIES", 3),
        }
    }
}

fn parse_or<T: std::str::FromStr + std::fmt::Display>(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = raw.as_str(), %default, "unparseable value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = OrchestratorConfig::from_lookup(|_| None);
        assert_eq!(config.database_url, "sqlite://signoff.db?mode=rwc");
        assert_eq!(config.pool.busy_timeout, Duration::from_millis(5_000));
        assert_eq!(config.pool.max_readers, 8);
        assert!(config.signing_key.is_none());
        assert_eq!(config.bus.max_retries, 3);
        assert_eq!(config.timeout.scan_interval, Duration::from_secs(10));
        assert_eq!(config.approval.default_timeout_seconds, 3600);
        assert_eq!(config.max_workflow_retries, 3);
    }

    #[test]
    fn configured_values_are_used() {
        let config = OrchestratorConfig::from_lookup(lookup_from(&[
            ("DATABASE_URL", "sqlite:///tmp/x.db?mode=rwc"),
            ("DATABASE_BUSY_TIMEOUT_MS", "2500"),
            ("DATABASE_MAX_READERS", "4"),
            ("SIGNING_KEY", "super-secret"),
            ("EVENT_BUS_MAX_RETRIES", "7"),
            ("EVENT_BUS_BACKOFF_INITIAL", "250"),
            ("EVENT_BUS_BACKOFF_MULTIPLIER", "3.5"),
            ("TIMEOUT_SCAN_INTERVAL_SECONDS", "2"),
            ("DEFAULT_APPROVAL_TIMEOUT_SECONDS", "60"),
            ("TASK_FAILURE_CONSUMES_RETRY", "false"),
        ]));

        assert_eq!(config.database_url, "sqlite:///tmp/x.db?mode=rwc");
        assert_eq!(config.pool.busy_timeout, Duration::from_millis(2_500));
        assert_eq!(config.pool.max_readers, 4);
        assert!(config.signing_key.is_some());
        assert_eq!(config.bus.max_retries, 7);
        assert_eq!(config.bus.backoff_initial, Duration::from_millis(250));
        assert_eq!(config.bus.backoff_multiplier, 3.5);
        assert_eq!(config.timeout.scan_interval, Duration::from_secs(2));
        assert_eq!(config.approval.default_timeout_seconds, 60);
        assert!(!config.timeout.task_failure_consumes_retry);
    }

    #[test]
    fn unparseable_value_falls_back_to_default() {
        let config = OrchestratorConfig::from_lookup(lookup_from(&[(
            "EVENT_BUS_MAX_RETRIES",
            "many",
        )]));
        assert_eq!(config.bus.max_retries, 3);
    }

    #[test]
    fn empty_signing_key_counts_as_missing() {
        let config = OrchestratorConfig::from_lookup(lookup_from(&[("SIGNING_KEY", "")]));
        assert!(config.signing_key.is_none());
    }
}
