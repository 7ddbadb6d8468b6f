// quota.rs - preference bookkeeping and periodic inbound quota distribution
use std::time::{Duration, Instant};

use ahash::AHashMap;

use crate::crypto::identity::PeerId;

/// Bounds applied when dividing the global budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaLimits {
    pub global_target_bpm: u32,
    pub min_bpm_per_peer: u32,
    /// Smaller changes are not pushed to the transport.
    pub min_bpm_change: u32,
    pub idle_timeout: Duration,
}

/// Per-peer facts the distributor needs for one round.
#[derive(Debug, Clone, Copy)]
pub struct QuotaInput {
    pub peer: PeerId,
    pub current_bpm: u32,
    pub last_activity: Instant,
    /// Handshake confirmation, or session creation while still unconfirmed.
    pub established_at: Instant,
}

/// A quota change to record locally and push to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUpdate {
    pub peer: PeerId,
    pub bpm: u32,
}

/// Tracks peer preferences and their running sum.
#[derive(Debug)]
pub struct Distributor {
    preferences: AHashMap<PeerId, u64>,
    sum: u64,
    limits: QuotaLimits,
}

impl Distributor {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            preferences: AHashMap::default(),
            sum: 0,
            limits,
        }
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    pub fn add_peer(&mut self, peer: PeerId) {
        self.preferences.entry(peer).or_insert(0);
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        if let Some(pref) = self.preferences.remove(peer) {
            self.sum -= pref;
        }
    }

    pub fn preference(&self, peer: &PeerId) -> Option<u64> {
        self.preferences.get(peer).copied()
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    /// Adds `delta` to the peer's preference; halves everyone first if the sum would wrap.
    pub fn increase_preference(&mut self, peer: &PeerId, delta: u64) -> bool {
        if !self.preferences.contains_key(peer) {
            return false;
        }
        if self.sum.checked_add(delta).is_none() {
            for pref in self.preferences.values_mut() {
                *pref /= 2;
            }
            self.sum = self.preferences.values().sum();
        }
        let delta = delta.min(u64::MAX - self.sum);
        if let Some(pref) = self.preferences.get_mut(peer) {
            *pref += delta;
            self.sum += delta;
        }
        true
    }

    /// Quota `peer` deserves out of the global budget among `peer_count` peers.
    pub fn target_for(&self, peer: &PeerId, peer_count: usize) -> u32 {
        let global = self.limits.global_target_bpm as u128;
        let count = peer_count.max(1) as u128;
        let min = (self.limits.min_bpm_per_peer as u128).min(global / count);
        let distributable = global.saturating_sub(count * min);
        let pref = self.preference(peer).unwrap_or(0) as u128;
        let share = distributable * pref / (1 + self.sum as u128);
        (min + share).min(u32::MAX as u128) as u32
    }

    /// Recomputes every peer's quota and returns the ones worth pushing.
    pub fn distribute(&self, peers: &[QuotaInput], now: Instant) -> Vec<QuotaUpdate> {
        let idle = self.limits.idle_timeout;
        let mut updates = Vec::new();
        for input in peers {
            let quiet = now.saturating_duration_since(input.last_activity) > idle;
            let settled = now.saturating_duration_since(input.established_at) > idle;
            let bpm = if quiet && settled {
                0
            } else {
                self.target_for(&input.peer, peers.len())
            };
            if bpm.abs_diff(input.current_bpm) > self.limits.min_bpm_change {
                updates.push(QuotaUpdate {
                    peer: input.peer,
                    bpm,
                });
            }
        }
        updates
    }
}
