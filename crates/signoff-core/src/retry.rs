//! Backoff computation for bus delivery retries and workflow-level retries.
//!
//! Stateless: all logic is in free functions that take configuration as
//! parameters. The bus uses plain exponential backoff; the timeout manager
//! adds jitter so that a batch of stalled workflows does not retry in
//! lockstep.

use std::time::Duration;

/// Longest delay either policy will ever produce.
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Exponential backoff for the `attempt`-th retry (0-based).
///
/// `initial * multiplier^attempt`, capped at five minutes.
pub fn backoff_delay(initial: Duration, multiplier: f64, attempt: u32) -> Duration {
    let factor = multiplier.max(1.0).powi(attempt.min(16) as i32);
    let millis = (initial.as_millis() as f64 * factor).min(MAX_BACKOFF.as_millis() as f64);
    Duration::from_millis(millis as u64)
}

/// Exponential backoff with +/-20% jitter, for workflow retries.
pub fn retry_delay_with_jitter(
    initial: Duration,
    multiplier: f64,
    retry_count: u32,
) -> Duration {
    let base = backoff_delay(initial, multiplier, retry_count);
    let jitter = 0.8 + fastrand::f64() * 0.4;
    let millis = (base.as_millis() as f64 * jitter).min(MAX_BACKOFF.as_millis() as f64);
    Duration::from_millis(millis as u64)
}
