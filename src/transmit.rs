// transmit.rs - per-peer FIFO of sealed frames and the send-slot contract
use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{
    api::{SendOutcome, SendTicket},
    handshake::CONTROL_PRIORITY,
    sched::PendingMessage,
};

/// One sealed transmission unit. Never modified after sealing.
#[derive(Debug)]
pub struct EncryptedFrame {
    bytes: Bytes,
    priority: u32,
    deadline: Instant,
    messages: Vec<PendingMessage>,
}

impl EncryptedFrame {
    /// Handshake frame at the fixed control priority.
    pub fn control(bytes: Bytes, deadline: Instant) -> Self {
        Self {
            bytes,
            priority: CONTROL_PRIORITY,
            deadline,
            messages: Vec::new(),
        }
    }

    /// Frame carrying a batch; completes `messages` once its fate is known.
    pub fn data(bytes: Bytes, priority: u32, deadline: Instant, messages: Vec<PendingMessage>) -> Self {
        Self {
            bytes,
            priority,
            deadline,
            messages,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn is_control(&self) -> bool {
        self.messages.is_empty()
    }

    fn complete(self, outcome: SendOutcome) {
        for msg in self.messages {
            msg.complete(outcome);
        }
    }
}

/// Parameters of a send-slot request for the head frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotRequest {
    pub ticket: SendTicket,
    pub max_size: usize,
    pub priority: u32,
    pub deadline: Duration,
}

/// What a send-slot callback did to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotResult {
    /// Head frame copied into the buffer.
    Sent { bytes: usize, control: bool },
    /// No usable buffer; the head frame was dropped.
    Dropped,
    /// Callback for a ticket that is no longer outstanding.
    Stale,
}

/// Strict FIFO of frames with at most one outstanding slot request.
#[derive(Debug, Default)]
pub struct TransmitQueue {
    frames: VecDeque<EncryptedFrame>,
    outstanding: Option<SendTicket>,
}

impl TransmitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: EncryptedFrame) {
        self.frames.push_back(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn outstanding(&self) -> Option<SendTicket> {
        self.outstanding
    }

    /// Claims a slot request for the head frame unless one is in flight.
    pub fn next_request(&mut self, ticket: SendTicket, now: Instant) -> Option<SlotRequest> {
        if self.outstanding.is_some() {
            return None;
        }
        let head = self.frames.front()?;
        self.outstanding = Some(ticket);
        Some(SlotRequest {
            ticket,
            max_size: head.len(),
            priority: head.priority,
            deadline: head.deadline.saturating_duration_since(now),
        })
    }

    /// Transport callback for `ticket`; `None` means the slot was refused.
    pub fn on_slot(&mut self, ticket: SendTicket, buffer: Option<&mut [u8]>) -> SlotResult {
        if self.outstanding != Some(ticket) {
            return SlotResult::Stale;
        }
        self.outstanding = None;
        let Some(head) = self.frames.pop_front() else {
            return SlotResult::Stale;
        };
        match buffer {
            Some(buf) if buf.len() >= head.len() => {
                let bytes = head.len();
                buf[..bytes].copy_from_slice(&head.bytes);
                let control = head.is_control();
                head.complete(SendOutcome::Transmitted { bytes });
                SlotResult::Sent { bytes, control }
            }
            _ => {
                head.complete(SendOutcome::TransportDropped);
                SlotResult::Dropped
            }
        }
    }

    /// Forgets the outstanding request so it can be cancelled at the transport.
    pub fn cancel(&mut self) -> Option<SendTicket> {
        self.outstanding.take()
    }

    /// Removes every frame; their messages report a disconnect when dropped.
    pub fn drain(&mut self) -> Vec<EncryptedFrame> {
        self.outstanding = None;
        self.frames.drain(..).collect()
    }
}
