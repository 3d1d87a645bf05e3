//! Per-node retry policy.
//!
//! Stateless: the runner tracks the attempt number and asks the policy
//! whether another attempt is allowed and how long to wait first.

use std::time::Duration;

/// Delay between attempts when a node does not set its own.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How many times a failing node is re-attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first one.
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            retry_count,
            retry_delay,
        }
    }

    /// A single attempt with no retries.
    pub fn none() -> Self {
        Self::new(0, DEFAULT_RETRY_DELAY)
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Whether another attempt may follow the failed `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
