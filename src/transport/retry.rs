use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconnection policy for a transport session
///
/// The delay doubles after every failed attempt and is capped at
/// `max_delay_ms`; setting both delays to the same value gives a fixed delay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts before giving up (`None` = retry forever)
    pub max_attempts: Option<u32>,

    /// Delay after the first failed attempt
    pub delay_ms: u64,

    /// Upper bound for the growing delay
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            delay_ms: 2000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: Option<u32>, delay: Duration) -> Self {
        let delay_ms = delay.as_millis() as u64;
        Self {
            max_attempts,
            delay_ms,
            max_delay_ms: delay_ms,
        }
    }

    pub fn unbounded(delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: None,
            delay_ms: delay.as_millis() as u64,
            max_delay_ms: max_delay.as_millis() as u64,
        }
    }

    /// Delay to wait after `failed_attempts` consecutive failures (1-based)
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let cap = self.max_delay_ms.max(self.delay_ms);
        let shift = failed_attempts.saturating_sub(1).min(32);
        let millis = self.delay_ms.saturating_mul(1u64 << shift).min(cap);
        Duration::from_millis(millis)
    }

    /// Whether `attempts` failed attempts use up the policy
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.max(self.delay_ms))
    }
}
