//! # Exponential Backoff
//!
//! Requeue delays for transiently failing reconciles. Each consecutive
//! failure doubles the delay, starting at the minimum and capped at the
//! maximum (five minutes for SpecialResources).
//!
//! Sequence with the reconcile defaults: 5s, 10s, 20s, 40s, 80s, 160s, 300s (max).

use std::time::Duration;

/// Exponential backoff calculator
///
/// Each call to `next_backoff_seconds()` returns the current delay and
/// doubles it for the next call, never exceeding `max_seconds`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Minimum backoff value in seconds (first delay, and value after reset)
    min_seconds: u64,
    /// Current backoff value in seconds
    current_seconds: u64,
    /// Maximum backoff value in seconds
    max_seconds: u64,
}

impl ExponentialBackoff {
    /// Create a new backoff with the given minimum and maximum in seconds
    ///
    /// # Arguments
    ///
    /// * `min_seconds` - First delay (clamped to at least one second)
    /// * `max_seconds` - Ceiling for the sequence
    #[must_use]
    pub fn new(min_seconds: u64, max_seconds: u64) -> Self {
        let min_seconds = min_seconds.max(1);
        Self {
            min_seconds,
            current_seconds: min_seconds.min(max_seconds),
            max_seconds,
        }
    }

    /// Get the next backoff duration in seconds and advance the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let result_seconds = self.current_seconds;
        self.current_seconds = self.current_seconds.saturating_mul(2).min(self.max_seconds);
        result_seconds
    }

    /// Get the next backoff duration as a `Duration` and advance the sequence
    #[must_use]
    pub fn next_backoff(&mut self) -> Duration {
        Duration::from_secs(self.next_backoff_seconds())
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.current_seconds = self.min_seconds.min(self.max_seconds);
    }
}
