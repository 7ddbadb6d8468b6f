// sched/window.rs - bytes-per-minute window with capped backlog

use std::time::{Duration, Instant};

const MS_PER_MINUTE: u128 = 60_000;

/// Bytes a `bpm` rate accrues over `elapsed`.
pub fn bytes_for(bpm: u32, elapsed: Duration) -> u64 {
    let bytes = bpm as u128 * elapsed.as_millis() / MS_PER_MINUTE;
    bytes.min(u64::MAX as u128) as u64
}

/// Time a `bpm` rate needs to accrue `bytes`; unbounded when the rate is zero.
pub fn delay_for(bpm: u32, bytes: u64) -> Duration {
    if bpm == 0 {
        return Duration::MAX;
    }
    let ms = bytes as u128 * MS_PER_MINUTE / bpm as u128;
    Duration::from_millis(ms.min(u64::MAX as u128) as u64)
}

/// Byte balance for one direction of a peer, refilled from wall time.
///
/// The balance may go negative: frames are sent against projected credit and
/// the debt is repaid by later refills.
#[derive(Debug, Clone)]
pub struct BandwidthWindow {
    balance: i64,
    remainder: u128,
    last_refill: Instant,
    backlog_minutes: u32,
}

impl BandwidthWindow {
    pub fn new(now: Instant, backlog_minutes: u32) -> Self {
        Self {
            balance: 0,
            remainder: 0,
            last_refill: now,
            backlog_minutes: backlog_minutes.max(1),
        }
    }

    /// Window starting with `credit` bytes already available.
    pub fn with_credit(now: Instant, backlog_minutes: u32, credit: u64) -> Self {
        let mut window = Self::new(now, backlog_minutes);
        window.balance = credit.min(i64::MAX as u64) as i64;
        window
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Largest balance the window may hold at `bpm`.
    pub fn capacity(&self, bpm: u32) -> i64 {
        (bpm as i64).saturating_mul(self.backlog_minutes as i64)
    }

    /// Credits elapsed time at `bpm`.
    ///
    /// Without `force`, calls less than a minute after the previous refill are
    /// ignored so frequent recomputation coalesces.
    pub fn refill(&mut self, force: bool, bpm: u32, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if !force && elapsed < Duration::from_secs(60) {
            return;
        }
        let numerator = bpm as u128 * elapsed.as_millis() + self.remainder;
        let delta = (numerator / MS_PER_MINUTE).min(i64::MAX as u128) as i64;
        self.remainder = numerator % MS_PER_MINUTE;
        self.last_refill = now;
        self.balance = self.balance.saturating_add(delta).min(self.capacity(bpm));
    }

    /// Records bytes actually sent or received.
    pub fn consume(&mut self, bytes: usize) {
        self.balance = self.balance.saturating_sub(bytes as i64);
    }

    /// Re-applies the backlog cap after the rate dropped.
    pub fn clamp(&mut self, bpm: u32) {
        self.balance = self.balance.min(self.capacity(bpm));
    }
}
