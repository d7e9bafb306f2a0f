//! Access-control loop: one [`Controller::step`] per iteration ties the
//! reader, lockout guard, master override and relay timer together.
//!
//! Each step runs, in order: relay timer tick, reader health check, refresh
//! of the enrolment flag, reader poll, and (if a card was read) the decision
//! list in [`crate::policy`]. The caller sleeps for the returned interval.
//!
//! ```text
//!            ┌──[master card]──▶ MasterActive ──[master card]──┐
//!            │                                                 ▼
//! Idle ──[card]──▶ Evaluating ──[granted]──▶ Engaged ──[timer]──▶ Idle
//!  ▲                   │
//!  │                [denied x11]
//!  │                   ▼
//!  └──[300 s / master]── Locked
//! ```
//!
//! The states are not stored as an enum; they fall out of the guard
//! conditions checked on every scan.

use std::time::Duration as StdDuration;

use time::{Duration, OffsetDateTime};
use tracing::{debug, error, info, warn};

use crate::config::{Config, IdleReference};
use crate::health::{HealthAction, ReaderHealth};
use crate::lockout::LockoutGuard;
use crate::master::MasterOverride;
use crate::outputs::{Indicator, OutputBoard};
use crate::policy::{self, Authorization, Decision, ScanContext};
use crate::reader::CardReader;
use crate::relay::{ActivationPolicy, RelayTimer};
use crate::store::{TokenRecord, TokenStore, SCAN_MODE, USAGE_CATEGORY};

/// Grace added on top of an activation before other cards are evaluated.
const ENGAGEMENT_GRACE: Duration = Duration::seconds(1);

// Pauses after each kind of scan, so one card held on the reader is not
// handled several times in a row.
const MASTER_DEBOUNCE: StdDuration = StdDuration::from_millis(1000);
const LOCKED_DEBOUNCE: StdDuration = StdDuration::from_millis(200);
const MASTER_MODE_DEBOUNCE: StdDuration = StdDuration::from_millis(500);
const ENGAGED_DEBOUNCE: StdDuration = StdDuration::from_millis(200);
const ENROL_DEBOUNCE: StdDuration = StdDuration::from_millis(500);
const GRANTED_DEBOUNCE: StdDuration = StdDuration::from_millis(100);
const DENIED_DEBOUNCE: StdDuration = StdDuration::from_millis(800);

/// What the caller should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Sleep this long, then step again.
    Continue(StdDuration),
    /// The reader could not be recovered; restart the process.
    Restart,
}

pub struct Controller<S, R> {
    store: S,
    reader: R,
    board: OutputBoard,
    lockout: LockoutGuard,
    relay: RelayTimer,
    master: MasterOverride,
    health: ReaderHealth,
    activation: ActivationPolicy,
    master_token: Option<String>,
    enrolment: bool,
    engaged_until: Option<OffsetDateTime>,
    last_activation: Option<OffsetDateTime>,
    poll_interval: StdDuration,
}

impl<S: TokenStore, R: CardReader> Controller<S, R> {
    pub fn new(
        cfg: &Config,
        store: S,
        reader: R,
        board: OutputBoard,
        master_token: Option<String>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            store,
            reader,
            board,
            lockout: LockoutGuard::new(&cfg.security),
            relay: RelayTimer::default(),
            master: MasterOverride::default(),
            health: ReaderHealth::new(&cfg.reader, now),
            activation: ActivationPolicy::new(&cfg.activation),
            master_token,
            enrolment: false,
            engaged_until: None,
            last_activation: None,
            poll_interval: cfg.runtime.poll_interval(),
        }
    }

    /// Run one loop iteration at `now`.
    pub async fn step(&mut self, now: OffsetDateTime) -> Step {
        self.relay.tick(&mut self.board, now);

        if !self.service_health(now) {
            return Step::Restart;
        }

        self.refresh_enrolment().await;

        let mut pause = self.poll_interval;
        if let Some(card_id) = self.reader.poll() {
            self.health.record_scan(now);
            pause += self.handle_card(&card_id, now).await;
        }

        self.apply_indicator(now);
        Step::Continue(pause)
    }

    /// Drive every output to its safe state.
    pub fn shutdown(&mut self) {
        let relays_were_on = self.board.relays_on();
        self.relay.cancel();
        self.board.all_off();
        info!(relays_were_on, "scheduler: outputs off");
    }

    // -----------------------------------------------------------------------
    // Per-iteration housekeeping
    // -----------------------------------------------------------------------

    /// Returns `false` when a reset failed and the process must restart.
    fn service_health(&mut self, now: OffsetDateTime) -> bool {
        let engaged = self.relay.is_active() || self.master.is_active();
        let action = self.health.due(now, engaged);
        if action == HealthAction::None {
            return true;
        }

        info!(?action, "health: resetting card reader");
        match self.reader.reset() {
            Ok(()) => {
                self.health.record_reset(now);
                true
            }
            Err(e) => {
                error!(?action, "health: reader reset failed: {e:#}");
                false
            }
        }
    }

    /// Settings errors read as "not enrolling".
    async fn refresh_enrolment(&mut self) {
        let enrolment = match self.store.get_setting(SCAN_MODE).await {
            Ok(v) => v.is_some_and(|v| v.trim() == "1"),
            Err(e) => {
                warn!("store: scan_mode read failed, assuming normal mode: {e:#}");
                false
            }
        };
        if enrolment != self.enrolment {
            info!(enrolment, "scheduler: enrolment mode changed");
            self.enrolment = enrolment;
        }
    }

    fn apply_indicator(&mut self, now: OffsetDateTime) {
        let indicator = if self.master.is_active() {
            Indicator::Master
        } else if self.lockout.is_locked(now) {
            Indicator::Off
        } else if self.relay.is_active() {
            Indicator::Active
        } else {
            Indicator::Ready
        };
        if self.board.indicator() != indicator {
            self.board.set_indicator(indicator);
        }
    }

    // -----------------------------------------------------------------------
    // Card handling
    // -----------------------------------------------------------------------

    /// Route one card through the decision list. Returns the debounce pause.
    async fn handle_card(&mut self, card_id: &str, now: OffsetDateTime) -> StdDuration {
        let ctx = ScanContext {
            is_master: policy::is_master_token(card_id, self.master_token.as_deref()),
            locked: self.lockout.is_locked(now),
            master_mode: self.master.is_active(),
            engaged: self.engaged_until.is_some_and(|until| now < until),
            enrolment: self.enrolment,
        };

        match policy::decide(ctx) {
            Decision::ToggleMaster => {
                self.lockout.clear();
                if self.master.toggle(&mut self.board) {
                    // Relays now stay on until the master card returns.
                    self.relay.cancel();
                    self.engaged_until = None;
                }
                MASTER_DEBOUNCE
            }
            Decision::IgnoreLocked => {
                debug!(
                    card = %card_id,
                    until = ?self.lockout.locked_until(),
                    "lockout: scan ignored while locked"
                );
                LOCKED_DEBOUNCE
            }
            Decision::IgnoreMasterMode => {
                debug!(card = %card_id, "master: scan ignored in master mode");
                MASTER_MODE_DEBOUNCE
            }
            Decision::IgnoreEngaged => {
                debug!(card = %card_id, "policy: scan ignored, machine in use");
                ENGAGED_DEBOUNCE
            }
            Decision::Enrol => {
                if let Err(e) = policy::enrol(&self.store, card_id, now).await {
                    warn!(card = %card_id, "store: enrolment failed: {e:#}");
                }
                ENROL_DEBOUNCE
            }
            Decision::Evaluate => match policy::authorize(&self.store, card_id).await {
                Authorization::Granted(token) => {
                    self.grant(&token, now).await;
                    GRANTED_DEBOUNCE
                }
                Authorization::Denied(reason) => {
                    self.lockout.record_invalid(now);
                    info!(
                        card = %card_id,
                        ?reason,
                        attempts = self.lockout.attempts(),
                        "policy: access denied"
                    );
                    self.board.set_indicator(Indicator::Ready);
                    DENIED_DEBOUNCE
                }
            },
        }
    }

    async fn grant(&mut self, token: &TokenRecord, now: OffsetDateTime) {
        self.board.set_indicator(Indicator::Active);

        // The idle reference is read before this use is logged.
        let duration = match self.activation.reference {
            IdleReference::LastActivation => self.activation.duration(self.last_activation, now),
            IdleReference::LastUsage => match self.store.last_usage_at().await {
                Ok(last_use) => self.activation.duration(last_use, now),
                Err(e) => {
                    warn!("store: last usage read failed, using base duration: {e:#}");
                    self.activation.base
                }
            },
        };

        if let Err(e) = self
            .store
            .log_usage(&token.token_id, USAGE_CATEGORY, now)
            .await
        {
            warn!(card = %token.token_id, "store: usage log write failed: {e:#}");
        }

        info!(
            card = %token.token_id,
            name = %token.name,
            duration_sec = duration.whole_seconds(),
            "policy: access granted"
        );
        self.last_activation = Some(now);
        self.engaged_until = Some(now + duration + ENGAGEMENT_GRACE);
        self.relay.activate(&mut self.board, now, duration);
    }
}

#[cfg(all(test, not(feature = "gpio")))]
impl<S, R> Controller<S, R> {
    pub(crate) fn board(&self) -> &OutputBoard {
        &self.board
    }

    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    pub(crate) fn reader_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub(crate) fn lockout(&self) -> &LockoutGuard {
        &self.lockout
    }

    pub(crate) fn master_active(&self) -> bool {
        self.master.is_active()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
