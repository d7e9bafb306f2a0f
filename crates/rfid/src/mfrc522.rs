//! MFRC522 register protocol: init, REQA/REQIDL request, cascade-level-1
//! anticollision.
//!
//! Only the subset needed to read a card's UID is implemented. Every call is
//! bounded by the chip's own timer (~25 ms at the init settings below) plus a
//! fixed IRQ polling budget, so a poll never blocks the caller for long.

use tracing::debug;

use crate::{Result, RfidError, Uid};

// ── Register addresses ──────────────────────────────────────────────────────

pub const COMMAND_REG: u8 = 0x01;
pub const COMM_IEN_REG: u8 = 0x02;
pub const COMM_IRQ_REG: u8 = 0x04;
pub const ERROR_REG: u8 = 0x06;
pub const FIFO_DATA_REG: u8 = 0x09;
pub const FIFO_LEVEL_REG: u8 = 0x0A;
pub const CONTROL_REG: u8 = 0x0C;
pub const BIT_FRAMING_REG: u8 = 0x0D;
pub const MODE_REG: u8 = 0x11;
pub const TX_CONTROL_REG: u8 = 0x14;
pub const TX_AUTO_REG: u8 = 0x15;
pub const T_MODE_REG: u8 = 0x2A;
pub const T_PRESCALER_REG: u8 = 0x2B;
pub const T_RELOAD_REG_H: u8 = 0x2C;
pub const T_RELOAD_REG_L: u8 = 0x2D;
pub const VERSION_REG: u8 = 0x37;

/// VersionReg values of MFRC522 v1.0 and v2.0, plus the 0x88 common on clones.
pub const KNOWN_VERSIONS: [u8; 3] = [0x91, 0x92, 0x88];

// ── PCD commands ────────────────────────────────────────────────────────────

pub const PCD_IDLE: u8 = 0x00;
pub const PCD_TRANSCEIVE: u8 = 0x0C;
pub const PCD_SOFT_RESET: u8 = 0x0F;

// ── PICC commands ───────────────────────────────────────────────────────────

/// Request idle cards (not halted).
pub const PICC_REQIDL: u8 = 0x26;
/// Anticollision, cascade level 1.
pub const PICC_ANTICOLL: u8 = 0x93;

// ── IRQ bits ────────────────────────────────────────────────────────────────

/// Interrupts enabled for a transceive: Tx, Rx, Idle, LoAlert, Err, Timer.
const IRQ_EN_TRANSCEIVE: u8 = 0x77;
/// RxIRq | IdleIRq: the frame came back.
const IRQ_WAIT_TRANSCEIVE: u8 = 0x30;
/// TimerIRq: nobody answered before the chip's timer ran out.
const IRQ_TIMER: u8 = 0x01;
/// BufferOvfl | CollErr | ParityErr | ProtocolErr.
const ERROR_MASK: u8 = 0x1B;

/// Upper bound on IRQ register polls per transceive.
const IRQ_POLL_BUDGET: u32 = 2000;
/// FIFO bytes we are willing to read back.
const MAX_RESPONSE_LEN: usize = 16;
/// An ATQA is exactly two bytes.
const ATQA_BITS: usize = 16;

/// Byte-wide register access. Implemented over SPI on real hardware and by
/// fakes in tests.
pub trait RegisterBus {
    fn read(&mut self, reg: u8) -> Result<u8>;
    fn write(&mut self, reg: u8, value: u8) -> Result<()>;
}

/// SPI address byte for a register write: `0aaaaaa0`.
pub fn write_address(reg: u8) -> u8 {
    (reg << 1) & 0x7E
}

/// SPI address byte for a register read: `1aaaaaa0`.
pub fn read_address(reg: u8) -> u8 {
    write_address(reg) | 0x80
}

/// Frame length in bits from the FIFO level and `ControlReg.RxLastBits`.
fn response_bits(fifo_level: u8, last_bits: u8) -> usize {
    let level = fifo_level as usize;
    if last_bits != 0 {
        level.saturating_sub(1) * 8 + last_bits as usize
    } else {
        level * 8
    }
}

pub struct Mfrc522<B> {
    bus: B,
}

impl<B: RegisterBus> Mfrc522<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Soft-reset the chip and program timer, modulation and CRC preset,
    /// then switch the antenna on.
    pub fn init(&mut self) -> Result<()> {
        self.bus.write(COMMAND_REG, PCD_SOFT_RESET)?;

        let version = self.bus.read(VERSION_REG)?;
        if !KNOWN_VERSIONS.contains(&version) {
            return Err(RfidError::Version(version));
        }

        // TAuto=1, prescaler 0xD3E => ~40 kHz timer; reload 30 => ~25 ms
        // timeout per transceive.
        self.bus.write(T_MODE_REG, 0x8D)?;
        self.bus.write(T_PRESCALER_REG, 0x3E)?;
        self.bus.write(T_RELOAD_REG_L, 30)?;
        self.bus.write(T_RELOAD_REG_H, 0)?;

        // 100% ASK modulation, CRC preset 0x6363.
        self.bus.write(TX_AUTO_REG, 0x40)?;
        self.bus.write(MODE_REG, 0x3D)?;

        self.antenna_on()?;
        debug!(version = format_args!("{version:#04x}"), "mfrc522 initialised");
        Ok(())
    }

    fn antenna_on(&mut self) -> Result<()> {
        let current = self.bus.read(TX_CONTROL_REG)?;
        if current & 0x03 != 0x03 {
            self.set_bits(TX_CONTROL_REG, 0x03)?;
        }
        Ok(())
    }

    fn set_bits(&mut self, reg: u8, mask: u8) -> Result<()> {
        let v = self.bus.read(reg)?;
        self.bus.write(reg, v | mask)
    }

    fn clear_bits(&mut self, reg: u8, mask: u8) -> Result<()> {
        let v = self.bus.read(reg)?;
        self.bus.write(reg, v & !mask)
    }

    /// Send `data` to the card and collect its answer as `(bytes, bits)`.
    fn transceive(&mut self, data: &[u8]) -> Result<(Vec<u8>, usize)> {
        self.bus.write(COMM_IEN_REG, IRQ_EN_TRANSCEIVE | 0x80)?;
        self.clear_bits(COMM_IRQ_REG, 0x80)?;
        self.set_bits(FIFO_LEVEL_REG, 0x80)?; // flush FIFO
        self.bus.write(COMMAND_REG, PCD_IDLE)?;

        for &b in data {
            self.bus.write(FIFO_DATA_REG, b)?;
        }

        self.bus.write(COMMAND_REG, PCD_TRANSCEIVE)?;
        self.set_bits(BIT_FRAMING_REG, 0x80)?; // StartSend

        let mut irq = 0;
        let mut completed = false;
        for _ in 0..IRQ_POLL_BUDGET {
            irq = self.bus.read(COMM_IRQ_REG)?;
            if irq & (IRQ_TIMER | IRQ_WAIT_TRANSCEIVE) != 0 {
                completed = true;
                break;
            }
        }

        self.clear_bits(BIT_FRAMING_REG, 0x80)?;

        if !completed {
            return Err(RfidError::Protocol("transceive did not complete"));
        }
        if self.bus.read(ERROR_REG)? & ERROR_MASK != 0 {
            return Err(RfidError::Protocol("error register set after transceive"));
        }
        if irq & IRQ_EN_TRANSCEIVE & IRQ_TIMER != 0 {
            return Err(RfidError::NoTag);
        }

        let level = self.bus.read(FIFO_LEVEL_REG)?;
        let last_bits = self.bus.read(CONTROL_REG)? & 0x07;
        let bits = response_bits(level, last_bits);

        let n = (level as usize).clamp(1, MAX_RESPONSE_LEN);
        let mut back = Vec::with_capacity(n);
        for _ in 0..n {
            back.push(self.bus.read(FIFO_DATA_REG)?);
        }

        Ok((back, bits))
    }

    /// Ask for cards in the field. `Ok(())` means a card answered with an
    /// ATQA; [`RfidError::NoTag`] means the field is empty.
    pub fn request(&mut self, mode: u8) -> Result<()> {
        // Short frame: only 7 bits of the last byte are sent.
        self.bus.write(BIT_FRAMING_REG, 0x07)?;
        let (_, bits) = self.transceive(&[mode])?;
        if bits != ATQA_BITS {
            return Err(RfidError::Protocol("unexpected ATQA length"));
        }
        Ok(())
    }

    /// Cascade-level-1 anticollision; returns the checked UID.
    pub fn anticollision(&mut self) -> Result<Uid> {
        self.bus.write(BIT_FRAMING_REG, 0x00)?;
        let (back, _) = self.transceive(&[PICC_ANTICOLL, 0x20])?;
        Uid::from_anticollision(&back)
    }

    /// One complete poll: request, then anticollision. `Ok(None)` when no
    /// card is present.
    pub fn read_uid(&mut self) -> Result<Option<Uid>> {
        match self.request(PICC_REQIDL) {
            Ok(()) => {}
            Err(RfidError::NoTag) => return Ok(None),
            Err(e) => return Err(e),
        }
        self.anticollision().map(Some)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
