//! Bus-level retry policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::constants::MAX_ATTEMPTS;

/// Attempts and backoff for a single register access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Sleep after the n-th failed attempt; the last entry repeats.
    pub backoff_us: Vec<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            backoff_us: vec![10, 100, 1_000, 10_000, 250_000],
        }
    }
}

impl RetryPolicy {
    /// Policy with no sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff_us: Vec::new(),
        }
    }

    /// Backoff after `failures` consecutive failed attempts (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let idx = (failures.saturating_sub(1)) as usize;
        self.backoff_us
            .get(idx)
            .or(self.backoff_us.last())
            .map(|&us| Duration::from_micros(us))
            .unwrap_or(Duration::ZERO)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_table() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts(), 5);
        assert_eq!(policy.backoff(1), Duration::from_micros(10));
        assert_eq!(policy.backoff(2), Duration::from_micros(100));
        assert_eq!(policy.backoff(5), Duration::from_millis(250));
        assert_eq!(policy.backoff(9), Duration::from_millis(250));
    }

    #[test]
    fn test_immediate_policy() {
        let policy = RetryPolicy::immediate(0);
        assert_eq!(policy.attempts(), 1);
        assert_eq!(policy.backoff(3), Duration::ZERO);
    }
}
