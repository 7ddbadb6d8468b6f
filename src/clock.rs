// clock.rs - wall-clock timestamps carried on the wire
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch.
///
/// Session key creation times and frame timestamps are compared across hosts,
/// so they use wall-clock time rather than [`std::time::Instant`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Epoch zero, used before any key has been installed.
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_millis(ms: u64) -> Self {
        Self(ms)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Current wall-clock time. Clocks set before 1970 collapse to zero.
    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
            .unwrap_or(0);
        Self(ms)
    }

    /// Time elapsed between `self` and `now`; zero when `self` lies in the future.
    pub fn age(self, now: Timestamp) -> Duration {
        Duration::from_millis(now.0.saturating_sub(self.0))
    }

    pub fn saturating_sub(self, d: Duration) -> Self {
        let ms = d.as_millis().min(u64::MAX as u128) as u64;
        Self(self.0.saturating_sub(ms))
    }
}
