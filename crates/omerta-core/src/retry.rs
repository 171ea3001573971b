//! Retry policy with exponential backoff
//!
//! Transient failures (timeouts, send failures) are retried with
//! exponentially growing delays, optional ±25 % jitter and a hard cap.
//! The presets mirror how callers actually use the mesh: `quick` for
//! interactive probes, `network` for ordinary sends, `persistent` for
//! must-deliver traffic.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Jitter applied around each delay when enabled
const JITTER_FRACTION: f64 = 0.25;

/// Retry/backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds
    pub base_delay_ms: u64,
    /// Upper bound on any single delay, in milliseconds
    pub max_delay_ms: u64,
    /// Apply ±25 % jitter to each delay
    pub jitter: bool,
}

impl RetryConfig {
    /// 2 attempts, 100 ms base delay
    pub fn quick() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }

    /// 3 attempts, 500 ms base delay
    pub fn network() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }

    /// 5 attempts, 1 s base delay
    pub fn persistent() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }

    /// Delay to sleep after failed attempt number `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(20);
        let raw = self.base_delay_ms.saturating_mul(1u64 << exp);
        let capped = raw.min(self.max_delay_ms);

        let millis = if self.jitter {
            let factor = rand::rng().random_range(1.0 - JITTER_FRACTION..=1.0 + JITTER_FRACTION);
            (capped as f64 * factor) as u64
        } else {
            capped
        };
        Duration::from_millis(millis)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::network()
    }
}
