//! [`ChannelSwitch`] – maps a logical channel to the 4-line relay pattern.
//!
//! Line 0 is the master enable; lines 1–3 pick one of the analog paths. The
//! mapping is a fixed lookup table, not a binary encoding of `channel - 1`:
//!
//! | Channel | line0 | line1 | line2 | line3 |
//! |---------|-------|-------|-------|-------|
//! | 1       | 1     | 0     | 0     | 0     |
//! | 2       | 1     | 1     | 0     | 0     |
//! | 3       | 1     | 0     | 1     | 0     |
//! | 4       | 1     | 1     | 1     | 0     |
//! | 5       | 1     | 0     | 0     | 1     |
//! | 6       | 1     | 1     | 0     | 1     |
//! | 7       | 1     | 0     | 1     | 1     |
//! | 8       | 1     | 1     | 1     | 1     |
//! | all-off | 0     | 0     | 0     | 0     |
//!
//! Every activation drives all four lines low before raising the row's
//! "on" lines, so two paths are never energised together.

use benchrig_types::{Channel, RigError};
use tracing::{debug, warn};

use crate::relay::Relay;

pub const LINE_COUNT: usize = 4;

/// Relay states indexed by line number.
pub type RelayPattern = [bool; LINE_COUNT];

pub const ALL_OFF: RelayPattern = [false; LINE_COUNT];

const PATTERNS: [RelayPattern; 8] = [
    [true, false, false, false],
    [true, true, false, false],
    [true, false, true, false],
    [true, true, true, false],
    [true, false, false, true],
    [true, true, false, true],
    [true, false, true, true],
    [true, true, true, true],
];

/// The table row for `channel`.
pub fn pattern_for(channel: Channel) -> RelayPattern {
    PATTERNS[(channel.number() - Channel::MIN) as usize]
}

/// Owns the four relay-enable lines.
pub struct ChannelSwitch {
    lines: [Box<dyn Relay>; LINE_COUNT],
}

impl ChannelSwitch {
    /// Build a switch from its control lines, given in line order.
    pub fn new(lines: [Box<dyn Relay>; LINE_COUNT]) -> Self {
        Self { lines }
    }

    /// Validate a raw channel number and activate it.
    ///
    /// # Errors
    ///
    /// [`RigError::InvalidChannel`] for anything outside `1..=8`, without
    /// touching any line.
    pub fn activate(&mut self, channel: i64) -> Result<RelayPattern, RigError> {
        let channel = Channel::new(channel)?;
        self.activate_channel(channel)
    }

    /// Drive every line off, then raise the row's "on" lines.
    ///
    /// If a line write fails part-way the bank is driven back to all-off on
    /// a best-effort basis and the first error is returned.
    pub fn activate_channel(&mut self, channel: Channel) -> Result<RelayPattern, RigError> {
        let pattern = pattern_for(channel);
        self.all_off()?;
        for (line, on) in self.lines.iter_mut().zip(pattern) {
            if !on {
                continue;
            }
            if let Err(e) = line.set_state(true) {
                warn!(channel = %channel, line = line.id(), error = %e, "relay write failed, forcing all-off");
                let _ = self.all_off();
                return Err(e);
            }
        }
        debug!(channel = %channel, ?pattern, "channel activated");
        Ok(pattern)
    }

    /// De-energise every line. All lines are attempted; the first error wins.
    pub fn all_off(&mut self) -> Result<(), RigError> {
        let mut first_err = None;
        for line in &mut self.lines {
            if let Err(e) = line.set_state(false) {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Current line states.
    pub fn pattern(&self) -> RelayPattern {
        let mut out = ALL_OFF;
        for (slot, line) in out.iter_mut().zip(&self.lines) {
            *slot = line.state();
        }
        out
    }

    /// The channel whose row matches the current line states, if any.
    pub fn active_channel(&self) -> Option<Channel> {
        let current = self.pattern();
        Channel::all().find(|ch| pattern_for(*ch) == current)
    }

    /// Whether any line is energised.
    pub fn is_energised(&self) -> bool {
        self.pattern().iter().any(|on| *on)
    }
}
