//! RetryScheduler - backoff and attempt budget for failed messages
//!
//! Every failed message carries its own [`RetryState`], so one message with a
//! long backoff never delays the others handled by the same worker.

use std::time::Duration;

use contracts::{BackoffKind, ExhaustedAction, RetryConfig};
use rand::Rng;
use tokio::time::Instant;

/// Stand-in deadline when a configured delay does not fit an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Delay strategy between attempts
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Same delay every time
    Fixed { delay: Duration },
    /// `initial * factor^(attempt - 1)`, randomized by `jitter`, capped at `max`
    Exponential {
        initial: Duration,
        max: Duration,
        factor: f64,
        jitter: f64,
    },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential {
                initial,
                max,
                factor,
                jitter,
            } => {
                // attempt 0 would be powi(-1)
                let exponent = attempt.max(1) - 1;
                let base_ms = initial.as_millis() as f64 * factor.powi(exponent as i32);

                let delay_ms = if *jitter == 0.0 {
                    base_ms
                } else {
                    base_ms * rand::rng().random_range(1.0 - jitter..=1.0 + jitter)
                };

                // f64 -> u64 saturates, so overflowing growth lands on the cap
                Duration::from_millis(delay_ms as u64).min(*max)
            }
        }
    }
}

/// Retry policy for one worker
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts per message including the first write (None = unlimited)
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
    pub on_exhausted: ExhaustedAction,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        let backoff = match config.backoff {
            BackoffKind::Fixed => Backoff::Fixed {
                delay: Duration::from_millis(config.initial_delay_ms),
            },
            BackoffKind::Exponential => Backoff::Exponential {
                initial: Duration::from_millis(config.initial_delay_ms),
                max: Duration::from_millis(config.max_delay_ms),
                factor: config.factor,
                jitter: config.jitter,
            },
        };

        Self {
            max_attempts: config.attempt_budget(),
            backoff,
            on_exhausted: config.on_exhausted,
        }
    }

    /// Fixed-delay policy (mostly for tests)
    pub fn fixed(max_attempts: Option<u32>, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed { delay },
            on_exhausted: ExhaustedAction::Drop,
        }
    }

    pub fn with_on_exhausted(mut self, action: ExhaustedAction) -> Self {
        self.on_exhausted = action;
        self
    }
}

/// Per-message retry bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    /// Failed attempts so far
    pub attempt: u32,
    /// Earliest time the next attempt may run
    pub next_eligible: Instant,
}

impl RetryState {
    pub fn is_due(&self, now: Instant) -> bool {
        self.next_eligible <= now
    }
}

/// Outcome of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt again once `state.next_eligible` is reached
    Retry(RetryState),
    /// Budget spent, apply the terminal action
    Exhausted {
        attempts: u32,
        action: ExhaustedAction,
    },
}

/// Computes retry decisions from a [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryScheduler {
    policy: RetryPolicy,
}

impl RetryScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Record one more failure for a message
    ///
    /// `previous` is `None` on the first failure.
    pub fn on_failure(&self, previous: Option<RetryState>, now: Instant) -> RetryDecision {
        let attempt = previous.map_or(1, |state| state.attempt + 1);

        if let Some(max) = self.policy.max_attempts {
            if attempt >= max {
                return RetryDecision::Exhausted {
                    attempts: attempt,
                    action: self.policy.on_exhausted,
                };
            }
        }

        let delay = self.policy.backoff.delay(attempt);
        let next_eligible = now
            .checked_add(delay)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);

        RetryDecision::Retry(RetryState {
            attempt,
            next_eligible,
        })
    }
}
