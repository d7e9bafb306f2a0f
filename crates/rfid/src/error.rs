use thiserror::Error;

pub type Result<T> = std::result::Result<T, RfidError>;

#[derive(Debug, Error)]
pub enum RfidError {
    #[cfg(feature = "hardware")]
    #[error("spi transfer failed: {0}")]
    Spi(#[from] rppal::spi::Error),

    #[cfg(feature = "hardware")]
    #[error("gpio error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    /// Nothing answered the request. The normal "no card present" case.
    #[error("no tag in field")]
    NoTag,

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    /// VersionReg read back something other than a known chip revision,
    /// typically 0x00 or 0xFF from an unpowered or wedged reader.
    #[error("unknown chip version {0:#04x}")]
    Version(u8),

    #[error("uid checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },
}

impl RfidError {
    /// True when the error only means "no card right now".
    pub fn is_no_tag(&self) -> bool {
        matches!(self, Self::NoTag)
    }
}
