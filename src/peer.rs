// Per-peer session tying handshake, scheduling, transmission and receive together.
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::{
    api::{Action, Completion, OutboundMessage, SendOutcome, SendTicket},
    clients::{ClientRegistry, Notification},
    clock::Timestamp,
    config::Config,
    crypto::identity::{Identity, PeerId, PeerKey},
    handshake::{Handshake, HandshakeError, HandshakeState, HandshakeStep},
    metrics::Metrics,
    quota::QuotaInput,
    receive::{self, ReceiveError},
    replay::ReplayWindow,
    sched::{window::BandwidthWindow, Admission, Batch, PendingMessage, Scheduler, SchedulerLimits, Selection},
    transmit::{EncryptedFrame, SlotResult, TransmitQueue},
    wire::{self, BodyHeader, Message, MessageKind, SUB_HEADER_LEN},
};

/// Per-session settings derived from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub limits: SchedulerLimits,
    pub initial_retry: Duration,
    pub control_deadline: Duration,
    pub max_message_age: Duration,
    pub lookup_timeout: Duration,
    pub keepalive_interval: Duration,
    pub default_bpm: u32,
    pub backlog_minutes: u32,
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            limits: config.scheduler_limits(),
            initial_retry: config.handshake.initial_retry(),
            control_deadline: config.handshake.control_deadline(),
            max_message_age: config.handshake.max_message_age(),
            lookup_timeout: config.handshake.lookup_timeout(),
            keepalive_interval: config.handshake.keepalive_interval(),
            default_bpm: config.bandwidth.default_bpm,
            backlog_minutes: config.bandwidth.backlog_minutes,
        }
    }
}

/// Borrowed core state a session needs while handling an event.
pub struct SessionIo<'a> {
    pub identity: &'a Identity,
    pub clients: &'a mut ClientRegistry,
    pub actions: &'a mut VecDeque<Action>,
    pub next_ticket: &'a mut u64,
}

impl SessionIo<'_> {
    fn ticket(&mut self) -> SendTicket {
        *self.next_ticket += 1;
        SendTicket(*self.next_ticket)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerStatistics {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub messages_delivered: u64,
    pub protocol_violations: u64,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub id: PeerId,
    pub state: HandshakeState,
    pub plaintext_queue: usize,
    pub encrypted_queue: usize,
    pub send_outstanding: bool,
    pub send_balance: i64,
    pub receive_balance: i64,
    pub internal_out_bpm: u32,
    pub external_out_bpm: u32,
    pub inbound_bpm: u32,
    pub last_sent_seq: u32,
    pub last_received_seq: u32,
    pub preference: u64,
    pub idle_for: Duration,
    pub stats: PeerStatistics,
}

/// Everything kept for one connected peer.
#[derive(Debug)]
pub struct PeerSession {
    id: PeerId,
    settings: SessionSettings,
    handshake: Handshake,
    scheduler: Scheduler,
    transmit: TransmitQueue,
    replay: ReplayWindow,
    last_sent_seq: u32,
    send_window: BandwidthWindow,
    receive_window: BandwidthWindow,
    internal_out_bpm: u32,
    external_out_bpm: u32,
    inbound_bpm: u32,
    created_at: Instant,
    last_activity: Instant,
    last_keepalive: Option<Instant>,
    schedule_retry_at: Option<Instant>,
    lookup_pending: bool,
    stats: PeerStatistics,
    metrics: Arc<Metrics>,
}

impl PeerSession {
    pub fn new(id: PeerId, settings: SessionSettings, metrics: Arc<Metrics>, now: Instant) -> Self {
        let bpm = settings.default_bpm;
        Self {
            id,
            settings,
            handshake: Handshake::new(id, settings.initial_retry),
            scheduler: Scheduler::new(settings.limits),
            transmit: TransmitQueue::new(),
            replay: ReplayWindow::new(),
            last_sent_seq: 0,
            // A minute of credit so the first frames need not wait for a refill.
            send_window: BandwidthWindow::with_credit(now, settings.backlog_minutes, bpm as u64),
            receive_window: BandwidthWindow::with_credit(now, settings.backlog_minutes, bpm as u64),
            internal_out_bpm: bpm,
            external_out_bpm: 0,
            inbound_bpm: bpm,
            created_at: now,
            last_activity: now,
            last_keepalive: None,
            schedule_retry_at: None,
            lookup_pending: false,
            stats: PeerStatistics::default(),
            metrics,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn inbound_bpm(&self) -> u32 {
        self.inbound_bpm
    }

    /// Outbound cap: the larger of our own limit and the one the peer declared.
    pub fn effective_out_bpm(&self) -> u32 {
        self.internal_out_bpm.max(self.external_out_bpm)
    }

    pub fn quota_input(&self) -> QuotaInput {
        QuotaInput {
            peer: self.id,
            current_bpm: self.inbound_bpm,
            last_activity: self.last_activity,
            established_at: self.handshake.confirmed_at().unwrap_or(self.created_at),
        }
    }

    /// Records a new inbound quota already pushed to the transport.
    pub fn set_inbound_bpm(&mut self, bpm: u32) {
        self.inbound_bpm = bpm;
        self.receive_window.clamp(bpm);
    }

    pub fn set_outbound_limit(&mut self, io: &mut SessionIo<'_>, bpm: u32, now: Instant) {
        self.internal_out_bpm = bpm;
        self.send_window.clamp(self.effective_out_bpm());
        self.process(io, now);
    }

    /// Kicks off the key exchange right after connect.
    pub fn start(&mut self, io: &mut SessionIo<'_>, now: Instant) {
        io.actions.push_back(Action::SetReceiveQuota {
            peer: self.id,
            bpm: self.inbound_bpm,
        });
        let result = self.handshake.start(io.identity, now);
        self.apply(io, result, now);
    }

    pub fn on_lookup(&mut self, io: &mut SessionIo<'_>, key: Option<PeerKey>, now: Instant) {
        self.lookup_pending = false;
        let result = self.handshake.on_lookup(io.identity, key, now);
        self.apply(io, result, now);
    }

    /// Handles one transport frame, which may carry several top-level messages.
    pub fn on_receive(&mut self, io: &mut SessionIo<'_>, frame: &[u8], now: Instant) {
        for message in wire::messages(frame) {
            let message = match message {
                Ok(message) => message,
                Err(err) => {
                    self.violation("malformed", &err);
                    break;
                }
            };
            match message.kind {
                MessageKind::SetKey => {
                    let result = self.handshake.on_set_key(io.identity, message.body, now);
                    self.apply(io, result, now);
                }
                MessageKind::Ping => {
                    let result = self.handshake.on_ping(io.identity, &message, self.inbound_bpm);
                    self.apply(io, result, now);
                }
                MessageKind::Pong => {
                    let result = self.handshake.on_pong(&message, now);
                    if result.is_ok() && self.state() == HandshakeState::KeyConfirmed {
                        self.last_activity = now;
                    }
                    self.apply(io, result, now);
                }
                MessageKind::Encrypted => self.on_encrypted(io, &message, now),
            }
        }
    }

    /// Queues application traffic. Outcomes only reach `completion`.
    pub fn submit(
        &mut self,
        io: &mut SessionIo<'_>,
        message: OutboundMessage,
        completion: Option<Completion>,
        now: Instant,
    ) -> Admission {
        let encoded = match wire::encode_sub_message(message.msg_type, &message.payload) {
            Ok(encoded) => encoded,
            Err(_) => {
                if let Some(tx) = completion {
                    let _ = tx.send(SendOutcome::TooLarge);
                }
                return Admission::TooLarge;
            }
        };
        let pending = PendingMessage::new(
            encoded,
            message.msg_type,
            message.priority,
            message.deadline,
            completion,
        );
        let admission = self.scheduler.submit(pending);
        match admission {
            Admission::QueuedWithEviction => {
                self.metrics.messages_evicted.inc();
                warn!(peer = %self.id, "plaintext queue full, evicted lowest priority message");
            }
            Admission::Rejected => {
                self.metrics.messages_rejected.inc();
                debug!(peer = %self.id, priority = message.priority, "plaintext queue full, message rejected");
            }
            Admission::Queued | Admission::TooLarge => {}
        }
        self.schedule_retry_at = None;
        self.process(io, now);
        admission
    }

    /// Transport callback for a send slot; returns the bytes written.
    pub fn on_send_ready(
        &mut self,
        io: &mut SessionIo<'_>,
        ticket: SendTicket,
        buffer: Option<&mut [u8]>,
        now: Instant,
    ) -> usize {
        let written = match self.transmit.on_slot(ticket, buffer) {
            SlotResult::Sent { bytes, .. } => {
                self.send_window.consume(bytes);
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += bytes as u64;
                self.metrics.frames_sent.inc();
                self.metrics.bytes_sent.inc_by(bytes as u64);
                bytes
            }
            SlotResult::Dropped => {
                self.metrics.transport_failures.inc();
                debug!(peer = %self.id, ?ticket, "transport refused send slot");
                0
            }
            SlotResult::Stale => return 0,
        };
        self.process(io, now);
        written
    }

    /// Fires whatever timers are due.
    pub fn handle_timeout(&mut self, io: &mut SessionIo<'_>, now: Instant) {
        if self.handshake.retry_at().map_or(false, |at| at <= now) {
            let result = self.handshake.on_retry(io.identity, now);
            self.apply(io, result, now);
        }
        if self.keepalive_due(now) {
            self.last_keepalive = Some(now);
            match self.handshake.keepalive() {
                Ok(ping) => {
                    self.metrics.ping_sent.inc();
                    self.push_control(ping, now);
                }
                Err(err) => debug!(peer = %self.id, ?err, "keepalive skipped"),
            }
        }
        if self.schedule_retry_at.map_or(false, |at| at <= now) {
            self.schedule_retry_at = None;
        }
        self.process(io, now);
    }

    /// Earliest instant at which [`PeerSession::handle_timeout`] has work.
    pub fn next_timeout(&self) -> Option<Instant> {
        let keepalive = (self.state() == HandshakeState::KeyConfirmed)
            .then(|| self.keepalive_base().checked_add(self.settings.keepalive_interval))
            .flatten();
        [
            self.handshake.retry_at(),
            self.schedule_retry_at,
            self.scheduler.next_expiry(),
            keepalive,
        ]
            .into_iter()
            .flatten()
            .min()
    }

    /// Tears the session down, cancelling external requests and failing every message.
    pub fn close(&mut self, io: &mut SessionIo<'_>) {
        if self.lookup_pending {
            self.lookup_pending = false;
            io.actions.push_back(Action::CancelLookup { peer: self.id });
        }
        if let Some(ticket) = self.transmit.cancel() {
            io.actions.push_back(Action::CancelSendSlot {
                peer: self.id,
                ticket,
            });
        }
        for msg in self.scheduler.drain() {
            msg.complete(SendOutcome::Disconnected);
        }
        drop(self.transmit.drain());
        if self.state() == HandshakeState::KeyConfirmed {
            io.clients.broadcast(Notification::Disconnected { peer: self.id });
        }
        info!(peer = %self.id, state = ?self.state(), "session closed");
    }

    pub fn snapshot(&self, now: Instant, preference: u64) -> PeerSnapshot {
        PeerSnapshot {
            id: self.id,
            state: self.state(),
            plaintext_queue: self.scheduler.len(),
            encrypted_queue: self.transmit.len(),
            send_outstanding: self.transmit.outstanding().is_some(),
            send_balance: self.send_window.balance(),
            receive_balance: self.receive_window.balance(),
            internal_out_bpm: self.internal_out_bpm,
            external_out_bpm: self.external_out_bpm,
            inbound_bpm: self.inbound_bpm,
            last_sent_seq: self.last_sent_seq,
            last_received_seq: self.replay.last(),
            preference,
            idle_for: now.saturating_duration_since(self.last_activity),
            stats: self.stats.clone(),
        }
    }

    /// Requests a send slot for the head frame, encrypting more plaintext when idle.
    fn process(&mut self, io: &mut SessionIo<'_>, now: Instant) {
        let expired = self.scheduler.discard_expired(now);
        if expired > 0 {
            self.metrics.messages_expired.inc_by(expired as u64);
            debug!(peer = %self.id, expired, "discarded expired messages");
        }
        if self.transmit.outstanding().is_some() {
            return;
        }
        if self.transmit.is_empty() && !self.encrypt_next(io, now) {
            return;
        }
        let ticket = io.ticket();
        if let Some(request) = self.transmit.next_request(ticket, now) {
            io.actions.push_back(Action::RequestSendSlot {
                peer: self.id,
                ticket: request.ticket,
                max_size: request.max_size,
                priority: request.priority,
                deadline: request.deadline,
            });
        }
    }

    /// Runs the scheduler once; true when a frame was queued.
    fn encrypt_next(&mut self, io: &mut SessionIo<'_>, now: Instant) -> bool {
        if self.state() != HandshakeState::KeyConfirmed {
            return false;
        }
        if self.schedule_retry_at.map_or(false, |at| at > now) {
            return false;
        }
        let bpm = self.effective_out_bpm();
        match self.scheduler.select(&mut self.send_window, bpm, now) {
            Selection::Ready { .. } => {}
            Selection::Corked { retry } => {
                self.schedule_retry_at = now.checked_add(retry);
                return false;
            }
            Selection::Idle { retry } => {
                self.schedule_retry_at = retry.and_then(|retry| now.checked_add(retry));
                return false;
            }
        }
        let Some(batch) = self.scheduler.take_batch() else {
            return false;
        };
        match self.seal_batch(io, batch) {
            Ok(frame) => {
                self.transmit.push(frame);
                true
            }
            Err(err) => {
                warn!(peer = %self.id, ?err, "failed to seal batch");
                false
            }
        }
    }

    fn seal_batch(&mut self, io: &mut SessionIo<'_>, batch: Batch) -> Result<EncryptedFrame, HandshakeError> {
        let key = self.handshake.encrypt_key().ok_or(HandshakeError::NoSessionKey)?;
        let seq = self.last_sent_seq.wrapping_add(1);
        let mut body = BytesMut::with_capacity(wire::BODY_HEADER_LEN + batch.payload.len());
        BodyHeader {
            seq,
            inbound_bpm: self.inbound_bpm,
            timestamp: Timestamp::now(),
        }
        .write(&mut body);
        body.put_slice(&batch.payload);

        let header = wire::encrypted_header(body.len())?;
        let (hash, ciphertext) = key.seal_body(&header, &body)?;
        let bytes = wire::encode_encrypted(&header, &hash, &ciphertext);
        self.last_sent_seq = seq;

        self.metrics.batch_size.observe(batch.messages.len() as f64);
        for msg in &batch.messages {
            let payload = msg.encoded().slice(SUB_HEADER_LEN..);
            let dropped = io
                .clients
                .deliver_outbound(self.id, msg.msg_type(), msg.len() as u16, &payload);
            self.metrics.notification_drops.inc_by(dropped as u64);
        }
        debug!(peer = %self.id, seq, messages = batch.messages.len(), len = bytes.len(), "sealed frame");
        Ok(EncryptedFrame::data(bytes, batch.priority, batch.deadline, batch.messages))
    }

    fn on_encrypted(&mut self, io: &mut SessionIo<'_>, message: &Message<'_>, now: Instant) {
        let key = if self.state().can_receive() {
            self.handshake.decrypt_key()
        } else {
            None
        };
        let opened = match receive::open_frame(
            key,
            &mut self.replay,
            message,
            Timestamp::now(),
            self.settings.max_message_age,
        ) {
            Ok(opened) => opened,
            Err(err) => {
                match &err {
                    ReceiveError::Replay(_) => self.metrics.replay_drops.inc(),
                    ReceiveError::Stale { .. } => self.metrics.stale_drops.inc(),
                    _ => {}
                }
                self.violation(err.kind(), &err);
                return;
            }
        };

        let size = message.size();
        self.receive_window.refill(false, self.inbound_bpm, now);
        self.receive_window.consume(size);
        self.external_out_bpm = opened.header.inbound_bpm;
        self.send_window.clamp(self.effective_out_bpm());
        self.last_activity = now;
        self.stats.frames_received += 1;
        self.stats.bytes_received += size as u64;
        self.metrics.frames_received.inc();
        self.metrics.bytes_received.inc_by(size as u64);

        for sub in opened.sub_messages() {
            match sub {
                Ok(sub) => {
                    self.stats.messages_delivered += 1;
                    let dropped =
                        io.clients
                            .deliver_inbound(self.id, sub.msg_type, sub.size, sub.payload);
                    self.metrics.notification_drops.inc_by(dropped as u64);
                }
                Err(err) => {
                    self.violation("malformed", &err);
                    break;
                }
            }
        }
    }

    fn apply(&mut self, io: &mut SessionIo<'_>, result: Result<HandshakeStep, HandshakeError>, now: Instant) {
        let step = match result {
            Ok(step) => step,
            Err(err) => {
                let kind = match &err {
                    HandshakeError::Wire(_) => "malformed",
                    HandshakeError::Signature(_) => "signature",
                    HandshakeError::WrongTarget(_) | HandshakeError::KeyMismatch(_) => "identity",
                    HandshakeError::StaleKey { .. } => "stale_key",
                    _ => "handshake",
                };
                self.violation(kind, &err);
                return;
            }
        };
        if step.key_installed {
            self.replay.reset();
        }
        if step.need_lookup && !self.lookup_pending {
            self.lookup_pending = true;
            io.actions.push_back(Action::LookupPublicKey {
                peer: self.id,
                timeout: self.settings.lookup_timeout,
            });
        }
        if let Some(bpm) = step.peer_bpm {
            self.external_out_bpm = bpm;
        }
        for frame in step.frames {
            self.count_control(&frame);
            self.push_control(frame, now);
        }
        if step.confirmed {
            self.last_activity = now;
            self.schedule_retry_at = None;
            self.metrics.sessions_confirmed.inc();
            info!(peer = %self.id, out_bpm = self.effective_out_bpm(), "session confirmed");
            io.clients.broadcast(Notification::Connected { peer: self.id });
        }
        self.process(io, now);
    }

    fn push_control(&mut self, frame: Bytes, now: Instant) {
        let deadline = now.checked_add(self.settings.control_deadline).unwrap_or(now);
        self.transmit.push(EncryptedFrame::control(frame, deadline));
    }

    fn count_control(&self, frame: &[u8]) {
        for message in wire::messages(frame).flatten() {
            match message.kind {
                MessageKind::SetKey => self.metrics.set_key_sent.inc(),
                MessageKind::Ping => self.metrics.ping_sent.inc(),
                MessageKind::Pong => self.metrics.pong_sent.inc(),
                MessageKind::Encrypted => {}
            }
        }
    }

    fn keepalive_base(&self) -> Instant {
        self.last_keepalive
            .map_or(self.last_activity, |at| at.max(self.last_activity))
    }

    fn keepalive_due(&self, now: Instant) -> bool {
        self.state() == HandshakeState::KeyConfirmed
            && now.saturating_duration_since(self.keepalive_base()) >= self.settings.keepalive_interval
    }

    fn violation(&mut self, kind: &'static str, err: &dyn std::fmt::Display) {
        self.stats.protocol_violations += 1;
        self.metrics.protocol_violations.with_label_values(&[kind]).inc();
        warn!(peer = %self.id, kind, error = %err, "dropped inbound message");
    }
}
