//! Command retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Error message fragments that abort retrying, matched case-insensitively.
///
/// Free-text matching; a typed error code would be sturdier but adapters do
/// not agree on codes.
pub const NON_RETRYABLE_PATTERNS: [&str; 4] = [
    "device not found",
    "invalid command",
    "unauthorized",
    "permission denied",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt` (0-based); none before the first.
    ///
    /// `min(base * factor^(attempt - 1), max)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Whether an error message marks a failure that retrying cannot fix.
pub fn is_non_retryable(message: &str) -> bool {
    let message = message.to_lowercase();
    NON_RETRYABLE_PATTERNS.iter().any(|p| message.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 6,
            ..Default::default()
        };
        let delays: Vec<u64> = (0..6)
            .map(|k| policy.delay_for_attempt(k).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![0, 1_000, 2_000, 4_000, 8_000, 10_000]);
    }

    #[test]
    fn test_non_retryable_classification() {
        assert!(is_non_retryable("Device not found: bf123"));
        assert!(is_non_retryable("Command rejected: device not found (code 2001)"));
        assert!(is_non_retryable("Validation error: Invalid command: name must not be empty"));
        assert!(is_non_retryable("401 Unauthorized"));
        assert!(!is_non_retryable("Operation timeout after 5000ms"));
        assert!(!is_non_retryable("Command rejected: device is busy"));
    }
}
