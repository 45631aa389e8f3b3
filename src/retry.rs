//! Retry policy configuration for queued jobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Policy for retrying failed jobs.
///
/// `max_attempts` counts every execution, the first one included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Run once, never retry.
    None,

    /// Fixed delay between attempts.
    Fixed {
        /// Maximum number of attempts.
        max_attempts: u32,
        /// Delay between attempts.
        delay: Duration,
    },

    /// Exponential backoff between attempts.
    Exponential {
        /// Maximum number of attempts.
        max_attempts: u32,
        /// Delay after the first attempt (doubles each attempt).
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
    },
}

impl Default for RetryPolicy {
    /// Three attempts, 1s then 2s apart.
    fn default() -> Self {
        Self::exponential(3)
    }
}

impl RetryPolicy {
    /// Create an exponential backoff policy with sensible defaults.
    ///
    /// - Initial delay: 1 second
    /// - Max delay: 5 minutes
    pub fn exponential(max_attempts: u32) -> Self {
        Self::Exponential {
            max_attempts,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
        }
    }

    /// Create a fixed delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::Fixed {
            max_attempts,
            delay,
        }
    }

    /// Delay before the next attempt, after `attempt` (1-indexed) failed.
    ///
    /// Returns `None` once the attempts are used up.
    pub fn delay_after_attempt(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts() {
            return None;
        }
        match self {
            Self::None => None,
            Self::Fixed { delay, .. } => Some(*delay),
            Self::Exponential {
                initial_delay,
                max_delay,
                ..
            } => {
                // 2^(attempt-1) * initial_delay, capped at max_delay
                let multiplier = 2u64.saturating_pow(attempt.saturating_sub(1));
                let delay_ms = (initial_delay.as_millis() as u64).saturating_mul(multiplier);
                Some(Duration::from_millis(
                    delay_ms.min(max_delay.as_millis() as u64),
                ))
            }
        }
    }

    /// Returns the maximum number of attempts allowed.
    pub fn max_attempts(&self) -> u32 {
        match self {
            Self::None => 1,
            Self::Fixed { max_attempts, .. } => (*max_attempts).max(1),
            Self::Exponential { max_attempts, .. } => (*max_attempts).max(1),
        }
    }
}
