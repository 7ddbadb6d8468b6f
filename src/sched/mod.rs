// sched/mod.rs - per-peer plaintext queue and deadline/priority batching
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};

pub mod edf;
pub mod window;

use self::{
    edf::{DeadlineQueue, QueueKey},
    window::{bytes_for, delay_for, BandwidthWindow},
};
use crate::{
    api::{Completion, SendOutcome},
    wire::SUB_HEADER_LEN,
};

/// Limits for one peer's plaintext queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerLimits {
    pub max_entries: usize,
    /// Plaintext budget of one frame; also the reference size for corking.
    pub frame_size: usize,
    pub expiry_grace: Duration,
    pub max_cork_delay: Duration,
}

impl Default for SchedulerLimits {
    fn default() -> Self {
        Self {
            max_entries: 16,
            frame_size: 63 * 1024,
            expiry_grace: Duration::from_secs(1),
            max_cork_delay: Duration::from_secs(1),
        }
    }
}

/// A sub-message waiting for transmission, plus its completion.
///
/// Dropping a message that was never completed reports
/// [`SendOutcome::Disconnected`], so every completion fires exactly once.
#[derive(Debug)]
pub struct PendingMessage {
    encoded: Bytes,
    msg_type: u16,
    priority: u32,
    deadline: Instant,
    selected: bool,
    slack_deadline: Option<Instant>,
    completion: Option<Completion>,
}

impl PendingMessage {
    /// `encoded` is the full sub-message including its header.
    pub fn new(
        encoded: Bytes,
        msg_type: u16,
        priority: u32,
        deadline: Instant,
        completion: Option<Completion>,
    ) -> Self {
        Self {
            encoded,
            msg_type,
            priority,
            deadline,
            selected: false,
            slack_deadline: None,
            completion,
        }
    }

    pub fn len(&self) -> usize {
        self.encoded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.encoded.is_empty()
    }

    pub fn msg_type(&self) -> u16 {
        self.msg_type
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }

    /// Payload without the sub-message header.
    pub fn payload(&self) -> &[u8] {
        self.encoded.get(SUB_HEADER_LEN..).unwrap_or_default()
    }

    /// Reports `outcome` and consumes the message.
    pub fn complete(mut self, outcome: SendOutcome) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(outcome);
        }
    }

    fn expired(&self, now: Instant, grace: Duration) -> bool {
        self.deadline
            .checked_add(grace)
            .map_or(false, |limit| limit < now)
    }
}

impl Drop for PendingMessage {
    fn drop(&mut self) {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(SendOutcome::Disconnected);
        }
    }
}

/// What happened to a submitted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued,
    /// Queued after the lowest-priority entry was evicted.
    QueuedWithEviction,
    /// The queue was full of entries at least as important.
    Rejected,
    TooLarge,
}

/// Result of one scheduling round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// `bytes` worth of messages are marked; collect them with [`Scheduler::take_batch`].
    Ready { bytes: usize },
    /// The batch would be nearly empty and nothing is urgent; retry after the delay.
    Corked { retry: Duration },
    /// Nothing can go now; retry after the delay if set.
    Idle { retry: Option<Duration> },
}

/// Messages selected for one frame, concatenated in deadline order.
#[derive(Debug)]
pub struct Batch {
    pub messages: Vec<PendingMessage>,
    pub payload: Bytes,
    /// Sum of the constituent priorities.
    pub priority: u32,
    /// Earliest constituent deadline.
    pub deadline: Instant,
}

/// Deadline-ordered plaintext queue with the batching algorithm on top.
#[derive(Debug)]
pub struct Scheduler {
    queue: DeadlineQueue<PendingMessage>,
    limits: SchedulerLimits,
}

impl Scheduler {
    pub fn new(limits: SchedulerLimits) -> Self {
        Self {
            queue: DeadlineQueue::new(),
            limits,
        }
    }

    pub fn limits(&self) -> &SchedulerLimits {
        &self.limits
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queues `message`, evicting at most one less important entry when full.
    pub fn submit(&mut self, message: PendingMessage) -> Admission {
        if message.len() > self.limits.frame_size {
            message.complete(SendOutcome::TooLarge);
            return Admission::TooLarge;
        }
        let mut admission = Admission::Queued;
        if self.queue.len() >= self.limits.max_entries {
            match self.lowest_priority() {
                Some((key, lowest)) if message.priority > lowest => {
                    if let Some(evicted) = self.queue.remove(&key) {
                        evicted.complete(SendOutcome::Evicted);
                    }
                    admission = Admission::QueuedWithEviction;
                }
                _ => {
                    message.complete(SendOutcome::Rejected);
                    return Admission::Rejected;
                }
            }
        }
        self.queue.push(message.deadline, message);
        admission
    }

    /// Fails every message whose deadline plus grace has passed.
    pub fn discard_expired(&mut self, now: Instant) -> usize {
        let grace = self.limits.expiry_grace;
        let expired = self.queue.remove_where(|_, msg| msg.expired(now, grace));
        let count = expired.len();
        for msg in expired {
            msg.complete(SendOutcome::Expired);
        }
        count
    }

    /// Earliest instant at which a queued message expires.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.queue
            .next_deadline()
            .and_then(|deadline| deadline.checked_add(self.limits.expiry_grace))
    }

    /// Marks the messages that should form the next frame.
    ///
    /// Projects the send window forward to each deadline in EDF order. When the
    /// projection goes negative, the least important entry seen so far is
    /// excluded and the projection restarts. Expired entries should be
    /// discarded first.
    pub fn select(&mut self, window: &mut BandwidthWindow, bpm: u32, now: Instant) -> Selection {
        for (_, msg) in self.queue.iter_mut() {
            msg.selected = false;
        }
        if self.queue.is_empty() {
            return Selection::Idle { retry: None };
        }
        window.refill(false, bpm, now);

        let horizon = self.limits.frame_size.saturating_mul(2);
        let max_cork = self.limits.max_cork_delay;
        let mut excluded: Vec<QueueKey> = Vec::new();
        let (planned, slack, boundary) = loop {
            let mut avail = window.balance() as i128;
            let mut projected_at = window.last_refill();
            let mut planned = 0usize;
            let mut slack = Duration::MAX;
            let mut boundary = None;
            let mut lowest: Option<(QueueKey, u32)> = None;
            let mut overflow = false;

            for (key, msg) in self.queue.iter_mut() {
                if excluded.contains(key) {
                    continue;
                }
                if planned >= horizon {
                    boundary = Some(*key);
                    break;
                }
                if msg.deadline > projected_at {
                    avail += bytes_for(bpm, msg.deadline - projected_at) as i128;
                    projected_at = msg.deadline;
                }
                if lowest.map_or(true, |(_, p)| msg.priority <= p) {
                    lowest = Some((*key, msg.priority));
                }
                avail -= msg.len() as i128;
                planned += msg.len();
                if avail < 0 {
                    if let Some((victim, _)) = lowest {
                        excluded.push(victim);
                    }
                    overflow = true;
                    break;
                }

                slack = slack.min(delay_for(bpm, avail as u64));
                if msg.deadline <= now {
                    slack = Duration::ZERO;
                } else if let Some(granted) = msg.slack_deadline {
                    slack = slack.min(granted.saturating_duration_since(now));
                } else {
                    slack = slack.min(msg.deadline - now);
                    let cap = now.checked_add(max_cork).unwrap_or(msg.deadline);
                    msg.slack_deadline = Some(msg.deadline.min(cap));
                }
            }
            if !overflow {
                break (planned, slack, boundary);
            }
        };

        if slack > max_cork && planned.saturating_mul(4) < self.limits.frame_size {
            return Selection::Corked { retry: max_cork };
        }

        let mut budget = self.limits.frame_size;
        let mut bytes = 0;
        for (key, msg) in self.queue.iter_mut() {
            if boundary.map_or(false, |b| *key >= b) {
                break;
            }
            if excluded.contains(key) || msg.len() > budget {
                continue;
            }
            msg.selected = true;
            budget -= msg.len();
            bytes += msg.len();
        }
        if bytes > 0 {
            return Selection::Ready { bytes };
        }
        let retry = self
            .next_expiry()
            .map(|at| at.saturating_duration_since(now).min(max_cork));
        Selection::Idle { retry }
    }

    /// Removes the messages marked by the last [`Scheduler::select`].
    pub fn take_batch(&mut self) -> Option<Batch> {
        let messages = self.queue.remove_where(|_, msg| msg.selected);
        let deadline = messages.iter().map(|msg| msg.deadline).min()?;
        let total = messages.iter().map(PendingMessage::len).sum();
        let mut payload = BytesMut::with_capacity(total);
        let mut priority = 0u32;
        for msg in &messages {
            payload.put_slice(&msg.encoded);
            priority = priority.saturating_add(msg.priority);
        }
        Some(Batch {
            messages,
            payload: payload.freeze(),
            priority,
            deadline,
        })
    }

    /// Removes everything, earliest deadline first.
    pub fn drain(&mut self) -> Vec<PendingMessage> {
        self.queue.drain()
    }

    /// Ties go to the entry with the later deadline.
    fn lowest_priority(&self) -> Option<(QueueKey, u32)> {
        let mut lowest: Option<(QueueKey, u32)> = None;
        for (key, msg) in self.queue.iter() {
            if lowest.map_or(true, |(_, p)| msg.priority <= p) {
                lowest = Some((*key, msg.priority));
            }
        }
        lowest
    }
}
