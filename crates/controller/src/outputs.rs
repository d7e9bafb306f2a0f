//! Relay and indicator outputs. The `gpio` feature gates the real rppal
//! driver; without it, a mock implementation logs state changes.

use anyhow::Result;
use std::fmt;

use crate::config::OutputConfig;

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// What the red/green pair is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indicator {
    /// Red: standing by for a card.
    Ready,
    /// Green: an authorised activation is running.
    Active,
    /// Red + green: master override.
    Master,
    /// Both dark: security lockout, or shut down.
    Off,
}

impl Indicator {
    /// `(red, green)` lamp states.
    pub fn lamps(self) -> (bool, bool) {
        match self {
            Self::Ready => (true, false),
            Self::Active => (false, true),
            Self::Master => (true, true),
            Self::Off => (false, false),
        }
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Active => write!(f, "active"),
            Self::Master => write!(f, "master"),
            Self::Off => write!(f, "off"),
        }
    }
}

// ---------------------------------------------------------------------------
// Real GPIO board (production, needs rppal and a Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub struct OutputBoard {
    relays: Vec<(String, OutputPin)>, // relay name -> GPIO pin
    red: OutputPin,
    green: OutputPin,
    active_low: bool,
    relays_on: bool,
    indicator: Indicator,
}

#[cfg(feature = "gpio")]
fn drive(pin: &mut OutputPin, on: bool, active_low: bool) {
    // Logical ON is HIGH on active-high boards and LOW on active-low ones.
    if on != active_low {
        pin.set_high();
    } else {
        pin.set_low();
    }
}

#[cfg(feature = "gpio")]
impl OutputBoard {
    pub fn new(cfg: &OutputConfig) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open gpio")?;
        let output = |pin: i64| -> Result<OutputPin> {
            let p = gpio
                .get(pin as u8)
                .with_context(|| format!("failed to claim gpio {pin}"))?
                .into_output();
            Ok(p)
        };

        let mut relays = Vec::with_capacity(cfg.relays.len());
        for r in &cfg.relays {
            let mut pin = output(r.pin)?;
            // Fail-safe: ensure "OFF" at startup
            drive(&mut pin, false, cfg.active_low);
            relays.push((r.name.clone(), pin));
        }

        let mut red = output(cfg.red_led)?;
        let mut green = output(cfg.green_led)?;
        red.set_low();
        green.set_low();

        Ok(Self {
            relays,
            red,
            green,
            active_low: cfg.active_low,
            relays_on: false,
            indicator: Indicator::Off,
        })
    }

    pub fn set_relays(&mut self, on: bool) {
        for (name, pin) in &mut self.relays {
            drive(pin, on, self.active_low);
            tracing::debug!(relay = %name, pin = pin.pin(), on, "relay set");
        }
        self.relays_on = on;
    }

    pub fn set_indicator(&mut self, indicator: Indicator) {
        let (red, green) = indicator.lamps();
        if red {
            self.red.set_high();
        } else {
            self.red.set_low();
        }
        if green {
            self.green.set_high();
        } else {
            self.green.set_low();
        }
        self.indicator = indicator;
    }
}

// ---------------------------------------------------------------------------
// Mock board (development, no hardware, logs state changes)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub struct OutputBoard {
    relay_names: Vec<String>,
    relays_on: bool,
    indicator: Indicator,
    /// Number of relay writes, for asserting "exactly once" behaviour.
    pub(crate) relay_writes: usize,
}

#[cfg(not(feature = "gpio"))]
impl OutputBoard {
    pub fn new(cfg: &OutputConfig) -> Result<Self> {
        for r in &cfg.relays {
            tracing::info!(relay = %r.name, pin = r.pin, "[mock-gpio] registered relay (not wired)");
        }
        tracing::info!("[mock-gpio] output board initialised (no hardware)");
        Ok(Self {
            relay_names: cfg.relays.iter().map(|r| r.name.clone()).collect(),
            relays_on: false,
            indicator: Indicator::Off,
            relay_writes: 0,
        })
    }

    pub fn set_relays(&mut self, on: bool) {
        self.relays_on = on;
        self.relay_writes += 1;
        tracing::info!(
            relays = ?self.relay_names,
            "[mock-gpio] relays set {}",
            if on { "ON" } else { "OFF" }
        );
    }

    pub fn set_indicator(&mut self, indicator: Indicator) {
        if self.indicator != indicator {
            let (red, green) = indicator.lamps();
            tracing::info!(red, green, "[mock-gpio] indicator {indicator}");
        }
        self.indicator = indicator;
    }
}

// ---------------------------------------------------------------------------
// Shared by both boards
// ---------------------------------------------------------------------------

impl OutputBoard {
    pub fn relays_on(&self) -> bool {
        self.relays_on
    }

    pub fn indicator(&self) -> Indicator {
        self.indicator
    }

    /// Safe state: every relay and lamp off.
    pub fn all_off(&mut self) {
        self.set_relays(false);
        self.set_indicator(Indicator::Off);
    }
}

// ===========================================================================
// Tests
// ===========================================================================
