//! Brute-force protection: a rolling window of failed authorisations that
//! escalates to a timed lockout.

use std::collections::VecDeque;

use time::{Duration, OffsetDateTime};
use tracing::warn;

use crate::config::SecurityConfig;

pub struct LockoutGuard {
    attempts: VecDeque<OffsetDateTime>,
    locked_until: Option<OffsetDateTime>,
    max_attempts: usize,
    window: Duration,
    duration: Duration,
}

impl LockoutGuard {
    pub fn new(cfg: &SecurityConfig) -> Self {
        Self {
            attempts: VecDeque::new(),
            locked_until: None,
            max_attempts: cfg.max_invalid_attempts.max(0) as usize,
            window: Duration::seconds(cfg.window_sec),
            duration: Duration::seconds(cfg.lockout_sec),
        }
    }

    /// Record one failed authorisation. Returns `true` when this attempt
    /// started a lockout.
    pub fn record_invalid(&mut self, now: OffsetDateTime) -> bool {
        self.prune(now);
        self.attempts.push_back(now);

        if self.attempts.len() > self.max_attempts {
            let until = now + self.duration;
            warn!(
                attempts = self.attempts.len(),
                window_sec = self.window.whole_seconds(),
                %until,
                "lockout: too many invalid scans, locking out"
            );
            self.locked_until = Some(until);
            // Start the next window empty so an expired lockout is not
            // immediately re-triggered.
            self.attempts.clear();
            return true;
        }
        false
    }

    pub fn is_locked(&mut self, now: OffsetDateTime) -> bool {
        self.prune(now);
        match self.locked_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.locked_until = None;
                false
            }
            None => false,
        }
    }

    /// Drop the lockout and forget every recorded attempt.
    pub fn clear(&mut self) {
        self.locked_until = None;
        self.attempts.clear();
    }

    pub fn locked_until(&self) -> Option<OffsetDateTime> {
        self.locked_until
    }

    pub fn attempts(&self) -> usize {
        self.attempts.len()
    }

    fn prune(&mut self, now: OffsetDateTime) {
        while let Some(&oldest) = self.attempts.front() {
            if now - oldest > self.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-06 07:00 UTC);

    fn guard() -> LockoutGuard {
        LockoutGuard::new(&SecurityConfig::default())
    }

    fn secs(n: i64) -> Duration {
        Duration::seconds(n)
    }

    // -- Threshold ----------------------------------------------------------

    #[test]
    fn ten_attempts_do_not_lock() {
        let mut g = guard();
        for i in 0..10 {
            assert!(!g.record_invalid(T0 + secs(i)));
        }
        assert!(!g.is_locked(T0 + secs(10)));
        assert_eq!(g.attempts(), 10);
    }

    #[test]
    fn eleventh_attempt_locks_from_its_own_timestamp() {
        let mut g = guard();
        for i in 0..10 {
            g.record_invalid(T0 + secs(i));
        }
        let eleventh = T0 + secs(10);
        assert!(g.record_invalid(eleventh));
        assert_eq!(g.locked_until(), Some(eleventh + secs(300)));
        assert_eq!(g.attempts(), 0, "window is emptied when the lockout starts");
        assert!(g.is_locked(eleventh + secs(299)));
        assert!(!g.is_locked(eleventh + secs(300)));
        assert_eq!(g.locked_until(), None);
    }

    // -- Rolling window -----------------------------------------------------

    #[test]
    fn attempts_older_than_window_are_pruned() {
        let mut g = guard();
        for i in 0..10 {
            g.record_invalid(T0 + secs(i));
        }
        // 61s after the first attempt it has fallen out of the window.
        assert!(!g.record_invalid(T0 + secs(61)));
        assert_eq!(g.attempts(), 10);
    }

    #[test]
    fn entry_exactly_at_window_edge_is_kept() {
        let mut g = guard();
        g.record_invalid(T0);
        g.record_invalid(T0 + secs(60));
        assert_eq!(g.attempts(), 2);
    }

    #[test]
    fn slow_attempts_never_lock() {
        let mut g = guard();
        for i in 0..50 {
            assert!(!g.record_invalid(T0 + secs(i * 7)));
        }
        assert!(!g.is_locked(T0 + secs(400)));
    }

    // -- Clear --------------------------------------------------------------

    #[test]
    fn clear_unlocks_and_empties_window() {
        let mut g = guard();
        for i in 0..11 {
            g.record_invalid(T0 + secs(i));
        }
        assert!(g.is_locked(T0 + secs(11)));
        for i in 11..16 {
            g.attempts.push_back(T0 + secs(i));
        }

        g.clear();
        assert!(!g.is_locked(T0 + secs(12)));
        assert_eq!(g.attempts(), 0);
        assert!(!g.record_invalid(T0 + secs(13)));
    }

    #[test]
    fn custom_thresholds() {
        let mut g = LockoutGuard::new(&SecurityConfig {
            max_invalid_attempts: 2,
            window_sec: 5,
            lockout_sec: 30,
        });
        assert!(!g.record_invalid(T0));
        assert!(!g.record_invalid(T0 + secs(1)));
        assert!(g.record_invalid(T0 + secs(2)));
        assert_eq!(g.locked_until(), Some(T0 + secs(32)));
    }
}
