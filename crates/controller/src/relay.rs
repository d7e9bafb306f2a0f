//! Non-blocking relay activation and the activation-duration policy.

use time::{Duration, OffsetDateTime};
use tracing::info;

use crate::config::{ActivationConfig, IdleReference};
use crate::outputs::{Indicator, OutputBoard};

// ---------------------------------------------------------------------------
// Timer
// ---------------------------------------------------------------------------

/// Relays stay ON until `deactivate_at`; the main loop calls [`tick`] every
/// iteration instead of sleeping through the activation.
///
/// [`tick`]: RelayTimer::tick
#[derive(Debug, Default)]
pub struct RelayTimer {
    deactivate_at: Option<OffsetDateTime>,
}

impl RelayTimer {
    pub fn activate(&mut self, board: &mut OutputBoard, now: OffsetDateTime, duration: Duration) {
        board.set_relays(true);
        let until = now + duration;
        self.deactivate_at = Some(until);
        info!(
            duration_sec = duration.whole_seconds(),
            %until,
            "relay: activated"
        );
    }

    /// Switch relays off once the deadline has passed. Returns `true` only
    /// on the tick that did so.
    pub fn tick(&mut self, board: &mut OutputBoard, now: OffsetDateTime) -> bool {
        match self.deactivate_at {
            Some(at) if now >= at => {
                board.set_relays(false);
                board.set_indicator(Indicator::Ready);
                self.deactivate_at = None;
                info!("relay: activation finished, relays off");
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deactivate_at.is_some()
    }

    /// Forget the deadline without touching the outputs.
    pub fn cancel(&mut self) {
        self.deactivate_at = None;
    }
}

// ---------------------------------------------------------------------------
// Duration policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ActivationPolicy {
    pub base: Duration,
    pub extended: Duration,
    pub idle_threshold: Duration,
    pub reference: IdleReference,
}

impl ActivationPolicy {
    pub fn new(cfg: &ActivationConfig) -> Self {
        Self {
            base: Duration::seconds(cfg.base_sec),
            extended: Duration::seconds(cfg.extended_sec),
            idle_threshold: Duration::minutes(cfg.idle_threshold_min),
            reference: cfg.idle_reference,
        }
    }

    /// Extended duration after a long idle period (or when there is no
    /// previous use at all), base duration otherwise.
    pub fn duration(&self, last_use: Option<OffsetDateTime>, now: OffsetDateTime) -> Duration {
        match last_use {
            Some(at) if now - at <= self.idle_threshold => self.base,
            _ => self.extended,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::config::OutputConfig;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-05-06 07:00 UTC);

    fn board() -> OutputBoard {
        OutputBoard::new(&OutputConfig::default()).unwrap()
    }

    // -- RelayTimer ---------------------------------------------------------

    #[test]
    fn activate_turns_relays_on_until_deadline() {
        let mut b = board();
        let mut t = RelayTimer::default();
        t.activate(&mut b, T0, Duration::seconds(30));
        assert!(b.relays_on());
        assert!(t.is_active());

        assert!(!t.tick(&mut b, T0 + Duration::seconds(29)));
        assert!(b.relays_on());
    }

    #[test]
    fn tick_switches_off_exactly_once() {
        let mut b = board();
        let mut t = RelayTimer::default();
        t.activate(&mut b, T0, Duration::seconds(30));
        let writes_before = b.relay_writes;

        assert!(t.tick(&mut b, T0 + Duration::seconds(30)));
        assert!(!b.relays_on());
        assert_eq!(b.indicator(), Indicator::Ready);
        assert!(!t.is_active());

        for i in 31..40 {
            assert!(!t.tick(&mut b, T0 + Duration::seconds(i)));
        }
        assert_eq!(b.relay_writes, writes_before + 1);
    }

    #[test]
    fn idle_timer_tick_is_noop() {
        let mut b = board();
        let mut t = RelayTimer::default();
        assert!(!t.tick(&mut b, T0));
        assert_eq!(b.relay_writes, 0);
        assert_eq!(b.indicator(), Indicator::Off);
    }

    #[test]
    fn cancel_leaves_outputs_alone() {
        let mut b = board();
        let mut t = RelayTimer::default();
        t.activate(&mut b, T0, Duration::seconds(30));
        t.cancel();
        assert!(!t.is_active());
        assert!(b.relays_on());
        assert!(!t.tick(&mut b, T0 + Duration::minutes(5)));
        assert!(b.relays_on());
    }

    // -- ActivationPolicy ---------------------------------------------------

    #[test]
    fn default_policy_values() {
        let p = ActivationPolicy::new(&ActivationConfig::default());
        assert_eq!(p.base, Duration::seconds(30));
        assert_eq!(p.extended, Duration::seconds(90));
        assert_eq!(p.idle_threshold, Duration::hours(3));
        assert_eq!(p.reference, IdleReference::LastActivation);
    }

    #[test]
    fn recent_use_gets_base_duration() {
        let p = ActivationPolicy::new(&ActivationConfig::default());
        let now = T0 + Duration::hours(1);
        assert_eq!(p.duration(Some(T0), now), Duration::seconds(30));
        assert_eq!(p.duration(Some(T0), T0 + Duration::hours(3)), Duration::seconds(30));
    }

    #[test]
    fn long_idle_gets_extended_duration() {
        let p = ActivationPolicy::new(&ActivationConfig::default());
        let now = T0 + Duration::hours(3) + Duration::seconds(1);
        assert_eq!(p.duration(Some(T0), now), Duration::seconds(90));
    }

    #[test]
    fn first_use_gets_extended_duration() {
        let p = ActivationPolicy::new(&ActivationConfig::default());
        assert_eq!(p.duration(None, T0), Duration::seconds(90));
    }
}
