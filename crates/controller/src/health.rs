//! Card-reader health: proactive periodic resets and a watchdog that resets
//! the reader when no card has been read for a while.

use time::{Duration, OffsetDateTime};

use crate::config::ReaderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    None,
    PeriodicReset,
    WatchdogReset,
}

pub struct ReaderHealth {
    last_scan: OffsetDateTime,
    last_reset: OffsetDateTime,
    periodic: Duration,
    watchdog: Duration,
}

impl ReaderHealth {
    pub fn new(cfg: &ReaderConfig, now: OffsetDateTime) -> Self {
        Self {
            last_scan: now,
            last_reset: now,
            periodic: Duration::minutes(cfg.periodic_reset_min),
            watchdog: Duration::minutes(cfg.watchdog_min),
        }
    }

    /// Any successful read counts, whatever the authorisation outcome.
    pub fn record_scan(&mut self, now: OffsetDateTime) {
        self.last_scan = now;
    }

    pub fn record_reset(&mut self, now: OffsetDateTime) {
        self.last_scan = now;
        self.last_reset = now;
    }

    /// Which reset, if any, is due. Nothing is due while the machine is
    /// engaged; a skipped trigger is simply re-evaluated next iteration.
    pub fn due(&self, now: OffsetDateTime, engaged: bool) -> HealthAction {
        if engaged {
            return HealthAction::None;
        }
        if now - self.last_reset > self.periodic {
            HealthAction::PeriodicReset
        } else if now - self.last_scan > self.watchdog {
            HealthAction::WatchdogReset
        } else {
            HealthAction::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-06 07:00 UTC);

    fn health() -> ReaderHealth {
        ReaderHealth::new(&ReaderConfig::default(), T0)
    }

    #[test]
    fn fresh_reader_needs_nothing() {
        assert_eq!(health().due(T0 + Duration::minutes(15), false), HealthAction::None);
    }

    #[test]
    fn watchdog_fires_after_quiet_period() {
        let h = health();
        let now = T0 + Duration::minutes(15) + Duration::seconds(1);
        assert_eq!(h.due(now, false), HealthAction::WatchdogReset);
    }

    #[test]
    fn scans_keep_watchdog_quiet() {
        let mut h = health();
        h.record_scan(T0 + Duration::minutes(10));
        assert_eq!(h.due(T0 + Duration::minutes(20), false), HealthAction::None);
    }

    #[test]
    fn periodic_takes_priority_over_watchdog() {
        let h = health();
        let now = T0 + Duration::minutes(31);
        assert_eq!(h.due(now, false), HealthAction::PeriodicReset);
    }

    #[test]
    fn periodic_fires_even_with_regular_scans() {
        let mut h = health();
        h.record_scan(T0 + Duration::minutes(29));
        assert_eq!(h.due(T0 + Duration::minutes(31), false), HealthAction::PeriodicReset);
    }

    #[test]
    fn engaged_machine_defers_resets() {
        let h = health();
        assert_eq!(h.due(T0 + Duration::hours(2), true), HealthAction::None);
        assert_eq!(h.due(T0 + Duration::hours(2), false), HealthAction::PeriodicReset);
    }

    #[test]
    fn reset_restarts_both_clocks() {
        let mut h = health();
        let at = T0 + Duration::minutes(31);
        h.record_reset(at);
        assert_eq!(h.due(at + Duration::minutes(15), false), HealthAction::None);
        assert_eq!(
            h.due(at + Duration::minutes(16), false),
            HealthAction::WatchdogReset
        );
    }
}
