//! Card reader glue. With the `gpio` feature this drives the MFRC522 on the
//! Pi's SPI bus; without it, card ids are typed on stdin, one per line.

use anyhow::Result;

/// One poll per loop iteration. `poll` never fails: driver errors are logged
/// and read as "no card".
pub trait CardReader {
    fn poll(&mut self) -> Option<String>;

    /// Hardware reset and re-initialisation. An error here is unrecoverable
    /// for this process.
    fn reset(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// MFRC522 reader (production, needs rppal and a Raspberry Pi)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
mod hardware {
    use anyhow::{Context, Result};
    use brewlock_rfid::hardware::{ResetLine, SpiBus};
    use brewlock_rfid::Mfrc522;
    use tracing::{debug, info, warn};

    use super::CardReader;
    use crate::config::ReaderConfig;

    pub struct HardwareReader {
        chip: Mfrc522<SpiBus>,
        reset_line: Option<ResetLine>,
    }

    impl HardwareReader {
        pub fn open(cfg: &ReaderConfig) -> Result<Self> {
            let bus = SpiBus::open(cfg.spi_clock_hz).context("failed to open reader spi bus")?;
            let reset_line = cfg
                .reset_pin
                .map(|pin| {
                    ResetLine::new(pin as u8)
                        .with_context(|| format!("failed to claim reader reset gpio {pin}"))
                })
                .transpose()?;

            let mut reader = Self {
                chip: Mfrc522::new(bus),
                reset_line,
            };
            reader.chip.init().context("failed to initialise mfrc522")?;
            info!(reset_pin = ?cfg.reset_pin, "reader: mfrc522 ready");
            Ok(reader)
        }
    }

    impl CardReader for HardwareReader {
        fn poll(&mut self) -> Option<String> {
            match self.chip.read_uid() {
                Ok(uid) => uid.map(|u| u.to_hex()),
                Err(e) if e.is_no_tag() => None,
                Err(e) => {
                    debug!("reader: poll failed: {e}");
                    None
                }
            }
        }

        fn reset(&mut self) -> Result<()> {
            match &mut self.reset_line {
                Some(line) => line.pulse(),
                None => warn!("reader: no reset line wired, soft reset only"),
            }
            self.chip.init().context("mfrc522 re-init after reset failed")?;
            info!("reader: reset complete");
            Ok(())
        }
    }
}

#[cfg(feature = "gpio")]
pub use hardware::HardwareReader;

// ---------------------------------------------------------------------------
// Console reader (development, card ids from stdin)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
mod console {
    use anyhow::Result;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::mpsc;
    use tracing::{info, warn};

    use super::CardReader;

    pub struct ConsoleReader {
        rx: mpsc::Receiver<String>,
    }

    impl ConsoleReader {
        /// Spawn a task that forwards stdin lines. Must be called inside a
        /// tokio runtime.
        pub fn spawn() -> Self {
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(async move {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            if tx.send(line).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!("reader: stdin read failed: {e}");
                            break;
                        }
                    }
                }
            });
            info!("reader: console reader, type a card id and press enter");
            Self { rx }
        }

        #[cfg(test)]
        pub(crate) fn from_channel(rx: mpsc::Receiver<String>) -> Self {
            Self { rx }
        }
    }

    impl CardReader for ConsoleReader {
        fn poll(&mut self) -> Option<String> {
            while let Ok(line) = self.rx.try_recv() {
                if let Some(id) = normalise(&line) {
                    return Some(id);
                }
            }
            None
        }

        fn reset(&mut self) -> Result<()> {
            info!("reader: console reader reset (no-op)");
            Ok(())
        }
    }

    /// Card ids compare as lowercase hex; blank lines are ignored.
    pub(crate) fn normalise(line: &str) -> Option<String> {
        let id = line.trim();
        (!id.is_empty()).then(|| id.to_ascii_lowercase())
    }
}

#[cfg(not(feature = "gpio"))]
pub use console::ConsoleReader;
