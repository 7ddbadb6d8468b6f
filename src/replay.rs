// replay.rs - 32-entry sliding replay window over frame sequence numbers

use thiserror::Error;

/// Number of sequence numbers behind the high-water mark that are remembered.
pub const REPLAY_WINDOW_BITS: u32 = 32;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ReplayError {
    /// Sequence number was already accepted.
    #[error("duplicate sequence number {0}")]
    Duplicate(u32),
    /// Sequence number is older than the window covers.
    #[error("sequence number {seq} is more than 32 behind {last}")]
    Ancient { seq: u32, last: u32 },
}

/// High-water mark plus a bitmap of the 32 sequence numbers below it.
///
/// Bit `i` set means `last - (i + 1)` has been accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayWindow {
    last: u32,
    bitmap: u32,
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forgets everything; used when the peer installs a fresh key.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn last(&self) -> u32 {
        self.last
    }

    pub fn bitmap(&self) -> u32 {
        self.bitmap
    }

    /// Accepts `seq` exactly once, advancing the window when it is newer.
    pub fn check_and_insert(&mut self, seq: u32) -> Result<(), ReplayError> {
        if seq == self.last {
            return Err(ReplayError::Duplicate(seq));
        }
        if seq < self.last {
            let distance = self.last - seq;
            if distance > REPLAY_WINDOW_BITS {
                return Err(ReplayError::Ancient {
                    seq,
                    last: self.last,
                });
            }
            let bit = 1u32 << (distance - 1);
            if self.bitmap & bit != 0 {
                return Err(ReplayError::Duplicate(seq));
            }
            self.bitmap |= bit;
            return Ok(());
        }

        // The old high-water mark becomes bit (shift - 1).
        let shift = seq - self.last;
        self.bitmap = match shift {
            s if s < REPLAY_WINDOW_BITS => (self.bitmap << s) | (1u32 << (s - 1)),
            REPLAY_WINDOW_BITS => 1u32 << (REPLAY_WINDOW_BITS - 1),
            _ => 0,
        };
        self.last = seq;
        Ok(())
    }
}
