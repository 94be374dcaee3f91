//! Reconnection policy: bounded retries with exponential backoff.
//!
//! The policy is a pure function of `(reconnect_attempts, last_reconnect_at, now)`.
//! A retry that arrives inside the backoff window is not an error; the caller
//! simply drops the triggering event.

use std::time::Duration;
use tokio::time::Instant;

/// Upper bound on the backoff exponent; keeps `2^n` from overflowing.
const MAX_BACKOFF_SHIFT: u32 = 16;

/// Outcome of evaluating the policy for a failed peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry now.
    Retry,
    /// Inside the backoff window; eligible again after the given duration.
    Wait(Duration),
    /// Retry budget exhausted.
    Abandon,
}

/// Bounded-retry, exponential-backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl ReconnectPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    #[must_use]
    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// `base_delay * 2^attempts`, saturating.
    #[must_use]
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.min(MAX_BACKOFF_SHIFT);
        self.base_delay.saturating_mul(factor)
    }

    /// How long a timer should wait before the next retry becomes eligible.
    ///
    /// With no previous attempt the full `backoff_delay(attempts)` applies;
    /// otherwise only what is left of the window since `last_reconnect_at`.
    #[must_use]
    pub fn retry_delay(
        &self,
        attempts: u32,
        last_reconnect_at: Option<Instant>,
        now: Instant,
    ) -> Duration {
        let backoff = self.backoff_delay(attempts);
        match last_reconnect_at {
            None => backoff,
            Some(last) => backoff.saturating_sub(now.saturating_duration_since(last)),
        }
    }

    /// Decide whether a failed peer may be recreated now.
    #[must_use]
    pub fn evaluate(
        &self,
        attempts: u32,
        last_reconnect_at: Option<Instant>,
        now: Instant,
    ) -> RetryDecision {
        if attempts >= self.max_attempts {
            return RetryDecision::Abandon;
        }

        let Some(last) = last_reconnect_at else {
            return RetryDecision::Retry;
        };

        let backoff = self.backoff_delay(attempts);
        let elapsed = now.saturating_duration_since(last);
        if elapsed >= backoff {
            RetryDecision::Retry
        } else {
            RetryDecision::Wait(backoff - elapsed)
        }
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(
            crate::config::DEFAULT_MAX_RECONNECT_ATTEMPTS,
            Duration::from_millis(crate::config::DEFAULT_RECONNECT_BASE_DELAY_MS),
        )
    }
}
