//! Raspberry Pi wiring: MFRC522 on SPI0/CE0 plus an optional reset line.

use std::{thread, time::Duration};

use rppal::gpio::{Gpio, OutputPin};
use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

use crate::mfrc522::{read_address, write_address, RegisterBus};
use crate::Result;

/// How long the reset line is held low, and how long the chip gets to come
/// back up afterwards.
const RESET_HOLD: Duration = Duration::from_millis(100);
const RESET_SETTLE: Duration = Duration::from_millis(100);

/// MFRC522 register access over SPI0, chip-select 0.
pub struct SpiBus {
    spi: Spi,
}

impl SpiBus {
    pub fn open(clock_hz: u32) -> Result<Self> {
        let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, clock_hz, Mode::Mode0)?;
        tracing::info!(clock_hz, "mfrc522 spi bus opened");
        Ok(Self { spi })
    }
}

impl RegisterBus for SpiBus {
    fn read(&mut self, reg: u8) -> Result<u8> {
        let tx = [read_address(reg), 0];
        let mut rx = [0u8; 2];
        self.spi.transfer(&mut rx, &tx)?;
        Ok(rx[1])
    }

    fn write(&mut self, reg: u8, value: u8) -> Result<()> {
        self.spi.write(&[write_address(reg), value])?;
        Ok(())
    }
}

/// Active-low NRSTPD line. Held high while the chip runs.
pub struct ResetLine {
    pin: OutputPin,
}

impl ResetLine {
    pub fn new(bcm_pin: u8) -> Result<Self> {
        let mut pin = Gpio::new()?.get(bcm_pin)?.into_output();
        pin.set_high();
        Ok(Self { pin })
    }

    /// Hard power-down pulse. Blocks for roughly 200 ms.
    pub fn pulse(&mut self) {
        self.pin.set_low();
        thread::sleep(RESET_HOLD);
        self.pin.set_high();
        thread::sleep(RESET_SETTLE);
    }
}
