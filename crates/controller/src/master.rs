//! Master override: relays held ON indefinitely until the master card is
//! presented again.

use tracing::info;

use crate::outputs::{Indicator, OutputBoard};

#[derive(Debug, Default)]
pub struct MasterOverride {
    active: bool,
}

impl MasterOverride {
    pub fn enter(&mut self, board: &mut OutputBoard) {
        if self.active {
            return;
        }
        self.active = true;
        board.set_indicator(Indicator::Master);
        board.set_relays(true);
        info!("master: override on, relays held on");
    }

    pub fn exit(&mut self, board: &mut OutputBoard) {
        if !self.active {
            return;
        }
        self.active = false;
        board.set_relays(false);
        board.set_indicator(Indicator::Ready);
        info!("master: override off");
    }

    /// Flip the override. Returns the new state.
    pub fn toggle(&mut self, board: &mut OutputBoard) -> bool {
        if self.active {
            self.exit(board);
        } else {
            self.enter(board);
        }
        self.active
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}
