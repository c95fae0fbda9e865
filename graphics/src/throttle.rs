//! Swapchain recreation throttling.
//!
//! Surface resize and minimize can generate rapid repeated "out of date"
//! signals; without throttling, recreation can thrash faster than the
//! platform delivers a valid surface size. [`should_throttle`] is the pure
//! policy deciding whether a requested recreation should proceed now or be
//! deferred, based on recent failure history.
//!
//! The backoff is intentionally stepped, not exponential: it is tuned for
//! human-scale resize events, not network-style congestion:
//!
//! | consecutive failures | hold-off after last attempt |
//! |----------------------|-----------------------------|
//! | ≥ 1                  | 100 ms                      |
//! | ≥ 3                  | 500 ms                      |
//! | ≥ 6                  | 2000 ms                     |
//!
//! A first attempt (no failures yet) is never throttled.
//!
//! # Example
//!
//! ```
//! use emberfall_graphics::throttle::{RecreationHistory, should_throttle};
//! use std::time::Instant;
//!
//! let mut history = RecreationHistory::default();
//! let now = Instant::now();
//!
//! // First attempt goes through immediately.
//! assert!(!should_throttle(&history, now));
//!
//! history.record_attempt(now);
//! history.record_failure();
//!
//! // Retrying within 100ms of a failed attempt is deferred.
//! assert!(should_throttle(&history, now));
//! ```

use std::time::{Duration, Instant};

/// Advisory policy state for swapchain recreation.
///
/// Mutated on every recreation attempt; success resets the failure streak.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecreationHistory {
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
}

impl RecreationHistory {
    /// Record that a recreation attempt is starting now.
    pub fn record_attempt(&mut self, now: Instant) {
        self.last_attempt = Some(now);
    }

    /// Record that the last attempt produced a working swapchain.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record that the last attempt failed.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Current failure streak.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Time of the most recent attempt, if any.
    pub fn last_attempt(&self) -> Option<Instant> {
        self.last_attempt
    }
}

/// Whether a recreation requested at `now` should be deferred.
pub fn should_throttle(history: &RecreationHistory, now: Instant) -> bool {
    let Some(last) = history.last_attempt else {
        return false;
    };
    let elapsed = now.saturating_duration_since(last);
    let failures = history.consecutive_failures;

    if failures >= 6 && elapsed < Duration::from_millis(2000) {
        return true;
    }
    if failures >= 3 && elapsed < Duration::from_millis(500) {
        return true;
    }
    if failures > 0 && elapsed < Duration::from_millis(100) {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn history_with(failures: u32, last: Instant) -> RecreationHistory {
        let mut history = RecreationHistory::default();
        history.record_attempt(last);
        for _ in 0..failures {
            history.record_failure();
        }
        history
    }

    #[rstest]
    // One failure: held for 100ms, free afterwards.
    #[case(1, 50, true)]
    #[case(1, 150, false)]
    // Three failures: held for 500ms.
    #[case(3, 400, true)]
    #[case(3, 600, false)]
    // Six failures: held for 2000ms.
    #[case(6, 600, true)]
    #[case(6, 1900, true)]
    #[case(6, 2100, false)]
    fn backoff_steps(#[case] failures: u32, #[case] elapsed_ms: u64, #[case] throttled: bool) {
        let last = Instant::now();
        let history = history_with(failures, last);
        let now = last + Duration::from_millis(elapsed_ms);
        assert_eq!(should_throttle(&history, now), throttled);
    }

    #[test]
    fn first_attempt_is_never_throttled() {
        let history = RecreationHistory::default();
        assert!(!should_throttle(&history, Instant::now()));
    }

    #[test]
    fn zero_failures_is_never_throttled() {
        let last = Instant::now();
        let history = history_with(0, last);
        // Even 1ms after an attempt: no failures, no throttle.
        assert!(!should_throttle(&history, last + Duration::from_millis(1)));
    }

    #[test]
    fn success_resets_the_streak() {
        let last = Instant::now();
        let mut history = history_with(6, last);
        assert!(should_throttle(&history, last + Duration::from_millis(600)));

        history.record_success();
        assert_eq!(history.consecutive_failures(), 0);
        assert!(!should_throttle(&history, last + Duration::from_millis(1)));
    }

    #[test]
    fn clock_going_backwards_is_tolerated() {
        let last = Instant::now() + Duration::from_secs(1);
        let history = history_with(3, last);
        // `now` before the recorded attempt: saturates to zero elapsed.
        assert!(should_throttle(&history, Instant::now()));
    }

    #[test]
    fn two_failures_use_only_the_short_hold() {
        let last = Instant::now();
        let history = history_with(2, last);
        assert!(should_throttle(&history, last + Duration::from_millis(50)));
        assert!(!should_throttle(&history, last + Duration::from_millis(150)));
    }
}
