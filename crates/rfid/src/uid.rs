use std::fmt;

use crate::{Result, RfidError};

/// Bytes returned by a cascade-level-1 anticollision: four UID bytes plus the
/// block check character.
pub const ANTICOLL_LEN: usize = 5;

/// Card identifier as returned by anticollision, checksum byte included.
///
/// The check byte is kept so the hex form matches the ids earlier
/// deployments already stored (`"a1b2c3d4" + bcc`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid(Vec<u8>);

impl Uid {
    /// Validate an anticollision response: exactly five bytes, and the last
    /// one is the XOR of the first four.
    pub fn from_anticollision(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ANTICOLL_LEN {
            return Err(RfidError::Protocol("anticollision returned wrong length"));
        }
        let expected = bcc(&bytes[..ANTICOLL_LEN - 1]);
        let actual = bytes[ANTICOLL_LEN - 1];
        if expected != actual {
            return Err(RfidError::Checksum { expected, actual });
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex, two digits per byte.
    pub fn to_hex(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Block check character: XOR of all bytes.
pub fn bcc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}
