//! MFRC522 proximity-card reader driver.
//!
//! The register protocol lives in [`mfrc522`] and talks to the chip through a
//! [`RegisterBus`]. The `hardware` feature adds the `rppal`-backed SPI bus and
//! reset line; without it the crate still builds (and is tested) against any
//! bus implementation.

mod error;
pub mod mfrc522;
mod uid;

#[cfg(feature = "hardware")]
pub mod hardware;

pub use error::{Result, RfidError};
pub use mfrc522::{Mfrc522, RegisterBus};
pub use uid::Uid;
