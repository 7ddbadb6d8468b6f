// handshake.rs - SET_KEY / PING / PONG session establishment for one peer
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::debug;

use crate::{
    clock::Timestamp,
    crypto::{
        identity::{Identity, IdentityError, PeerId, PeerKey},
        session::{SessionError, SessionKey},
        wrap::{self, WrapError},
    },
    wire::{self, Message, MessageKind, PingPayload, PongPayload, SetKey, WireError},
};

/// Priority given to handshake frames on the transmit queue.
pub const CONTROL_PRIORITY: u32 = 0x00FF_FFFF;

/// Session establishment progress. Codes are what SET_KEY carries as sender status.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandshakeState {
    Down = 0,
    KeySent = 1,
    KeyReceived = 2,
    KeyConfirmed = 3,
}

impl HandshakeState {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Down),
            1 => Some(Self::KeySent),
            2 => Some(Self::KeyReceived),
            3 => Some(Self::KeyConfirmed),
            _ => None,
        }
    }

    /// True once the peer's key is installed.
    pub fn can_receive(self) -> bool {
        matches!(self, Self::KeyReceived | Self::KeyConfirmed)
    }
}

/// Reasons a handshake message is dropped. None of them change state.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("malformed handshake message: {0}")]
    Wire(#[from] WireError),
    #[error("message addressed to {0}")]
    WrongTarget(PeerId),
    #[error("SET_KEY signature: {0}")]
    Signature(#[from] IdentityError),
    #[error("SET_KEY created at {offered:?} is older than installed key {installed:?}")]
    StaleKey {
        offered: Timestamp,
        installed: Timestamp,
    },
    #[error("unknown sender status {0}")]
    UnknownStatus(u32),
    #[error("session key unwrap failed: {0}")]
    Unwrap(#[from] WrapError),
    #[error("session crypto failed: {0}")]
    Session(#[from] SessionError),
    #[error("PONG echoed challenge {got:#x}, expected {expected:#x}")]
    ChallengeMismatch { expected: u32, got: u32 },
    #[error("no session key for this direction yet")]
    NoSessionKey,
    #[error("looked-up key belongs to {0}")]
    KeyMismatch(PeerId),
}

/// What the caller must do after feeding the handshake an event.
#[derive(Debug, Default)]
pub struct HandshakeStep {
    /// Control frames to queue for the peer, in order.
    pub frames: Vec<Bytes>,
    /// A new decrypt key was installed; the replay window must be reset.
    pub key_installed: bool,
    /// The session just reached [`HandshakeState::KeyConfirmed`].
    pub confirmed: bool,
    /// Inbound limit the peer declared in a PONG.
    pub peer_bpm: Option<u32>,
    /// The peer's public key is needed before anything else can happen.
    pub need_lookup: bool,
}

/// Key exchange state for one peer.
#[derive(Debug)]
pub struct Handshake {
    peer: PeerId,
    state: HandshakeState,
    peer_key: Option<PeerKey>,
    encrypt_key: Option<SessionKey>,
    decrypt_key: Option<SessionKey>,
    set_key: Option<SetKey>,
    challenge: u32,
    pending_ping: Option<(Bytes, u32)>,
    pending_set_key: Option<Bytes>,
    started: bool,
    initial_retry: Duration,
    retry_interval: Duration,
    retry_at: Option<Instant>,
    confirmed_at: Option<Instant>,
}

impl Handshake {
    pub fn new(peer: PeerId, initial_retry: Duration) -> Self {
        Self {
            peer,
            state: HandshakeState::Down,
            peer_key: None,
            encrypt_key: None,
            decrypt_key: None,
            set_key: None,
            challenge: rand::random(),
            pending_ping: None,
            pending_set_key: None,
            started: false,
            initial_retry,
            retry_interval: initial_retry,
            retry_at: None,
            confirmed_at: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn peer_key_known(&self) -> bool {
        self.peer_key.is_some()
    }

    pub fn encrypt_key(&self) -> Option<&SessionKey> {
        self.encrypt_key.as_ref()
    }

    pub fn decrypt_key(&self) -> Option<&SessionKey> {
        self.decrypt_key.as_ref()
    }

    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    pub fn confirmed_at(&self) -> Option<Instant> {
        self.confirmed_at
    }

    /// Starts the exchange, or asks for a lookup when the peer key is unknown.
    pub fn start(&mut self, identity: &Identity, now: Instant) -> Result<HandshakeStep, HandshakeError> {
        let mut step = HandshakeStep::default();
        self.started = true;
        if self.state == HandshakeState::Down {
            self.send_key(identity, now, &mut step)?;
        }
        Ok(step)
    }

    /// Result of a directory lookup for this peer.
    pub fn on_lookup(
        &mut self,
        identity: &Identity,
        key: Option<PeerKey>,
        now: Instant,
    ) -> Result<HandshakeStep, HandshakeError> {
        let mut step = HandshakeStep::default();
        let key = match key {
            Some(key) if key.id() == self.peer => key,
            Some(key) => {
                self.pending_set_key = None;
                self.schedule_retry(now);
                return Err(HandshakeError::KeyMismatch(key.id()));
            }
            None => {
                debug!(peer = %self.peer, "public key lookup failed");
                self.pending_set_key = None;
                self.schedule_retry(now);
                return Ok(step);
            }
        };
        self.peer_key = Some(key);
        if let Some(held) = self.pending_set_key.take() {
            step = self.on_set_key(identity, &held, now)?;
        }
        if self.started && self.state == HandshakeState::Down {
            self.send_key(identity, now, &mut step)?;
        }
        Ok(step)
    }

    /// Handles a SET_KEY body (everything after the top-level header).
    pub fn on_set_key(
        &mut self,
        identity: &Identity,
        body: &[u8],
        now: Instant,
    ) -> Result<HandshakeStep, HandshakeError> {
        let mut step = HandshakeStep::default();
        let set_key = SetKey::parse(body)?;
        let Some(peer_key) = self.peer_key.as_ref() else {
            self.pending_set_key = Some(Bytes::copy_from_slice(body));
            step.need_lookup = true;
            return Ok(step);
        };
        if set_key.target != identity.id() {
            return Err(HandshakeError::WrongTarget(set_key.target));
        }
        peer_key.verify(&set_key.signed_bytes(), &set_key.signature)?;
        let sender_status = HandshakeState::from_code(set_key.sender_status)
            .ok_or(HandshakeError::UnknownStatus(set_key.sender_status))?;

        let installed = self.decrypt_key.as_ref().map(SessionKey::created);
        if let Some(installed) = installed {
            if self.state.can_receive() && set_key.creation < installed {
                return Err(HandshakeError::StaleKey {
                    offered: set_key.creation,
                    installed,
                });
            }
        }
        if installed != Some(set_key.creation) {
            let material = wrap::unwrap(identity.exchange_secret(), &set_key.wrapped_key)?;
            self.decrypt_key = Some(SessionKey::from_material(material, set_key.creation)?);
            step.key_installed = true;
            debug!(peer = %self.peer, creation = set_key.creation.as_millis(), "installed decrypt key");
        }

        let peer_behind = matches!(sender_status, HandshakeState::Down | HandshakeState::KeySent);
        match self.state {
            HandshakeState::Down => {
                self.state = HandshakeState::KeyReceived;
                self.send_key(identity, now, &mut step)?;
            }
            HandshakeState::KeySent => {
                self.state = HandshakeState::KeyReceived;
                if peer_behind {
                    self.send_key(identity, now, &mut step)?;
                }
            }
            HandshakeState::KeyReceived | HandshakeState::KeyConfirmed => {
                if peer_behind {
                    self.send_key(identity, now, &mut step)?;
                }
            }
        }

        if let Some((raw, inbound_bpm)) = self.pending_ping.take() {
            if let Some(Ok(message)) = wire::messages(&raw).next() {
                match self.answer_ping(identity, &message, inbound_bpm) {
                    Ok(frame) => step.frames.push(frame),
                    Err(err) => debug!(peer = %self.peer, ?err, "buffered PING dropped"),
                }
            }
        }
        Ok(step)
    }

    /// Answers a PING with a PONG carrying our declared inbound limit.
    ///
    /// Without a decrypt key the PING replaces whatever was buffered before.
    pub fn on_ping(
        &mut self,
        identity: &Identity,
        message: &Message<'_>,
        inbound_bpm: u32,
    ) -> Result<HandshakeStep, HandshakeError> {
        let mut step = HandshakeStep::default();
        if self.decrypt_key.is_none() {
            let mut raw = BytesMut::with_capacity(message.size());
            raw.put_slice(message.header);
            raw.put_slice(message.body);
            self.pending_ping = Some((raw.freeze(), inbound_bpm));
            debug!(peer = %self.peer, "buffered PING until a key arrives");
            return Ok(step);
        }
        step.frames.push(self.answer_ping(identity, message, inbound_bpm)?);
        Ok(step)
    }

    /// Handles a PONG answering our challenge.
    pub fn on_pong(&mut self, message: &Message<'_>, now: Instant) -> Result<HandshakeStep, HandshakeError> {
        let mut step = HandshakeStep::default();
        let key = self.encrypt_key.as_ref().ok_or(HandshakeError::NoSessionKey)?;
        let (nonce, ciphertext) = wire::split_control(message)?;
        let plaintext = key.open_control(message.header, &nonce, ciphertext)?;
        let pong = PongPayload::parse(&plaintext)?;
        if pong.challenge != self.challenge {
            return Err(HandshakeError::ChallengeMismatch {
                expected: self.challenge,
                got: pong.challenge,
            });
        }
        if pong.target != self.peer {
            return Err(HandshakeError::WrongTarget(pong.target));
        }
        step.peer_bpm = Some(pong.inbound_bpm);
        match self.state {
            HandshakeState::KeyReceived => {
                self.state = HandshakeState::KeyConfirmed;
                self.retry_at = None;
                self.retry_interval = self.initial_retry;
                self.confirmed_at = Some(now);
                step.confirmed = true;
            }
            HandshakeState::KeyConfirmed => {}
            // Our key reached the peer but theirs has not reached us; the
            // retry timer keeps going until their SET_KEY arrives.
            HandshakeState::Down | HandshakeState::KeySent => {
                debug!(peer = %self.peer, state = ?self.state, "PONG before peer key");
            }
        }
        Ok(step)
    }

    /// Re-sends SET_KEY and PING when the retry timer fired.
    pub fn on_retry(&mut self, identity: &Identity, now: Instant) -> Result<HandshakeStep, HandshakeError> {
        let mut step = HandshakeStep::default();
        match self.retry_at {
            Some(at) if at <= now && self.state != HandshakeState::KeyConfirmed => {}
            _ => return Ok(step),
        }
        self.retry_at = None;
        self.retry_interval = self.retry_interval.saturating_mul(2);
        self.send_key(identity, now, &mut step)?;
        Ok(step)
    }

    /// PING under the current challenge, sent to a quiet confirmed peer.
    pub fn keepalive(&self) -> Result<Bytes, HandshakeError> {
        let key = self.encrypt_key.as_ref().ok_or(HandshakeError::NoSessionKey)?;
        Self::seal_ping(key, self.challenge, self.peer)
    }

    fn send_key(
        &mut self,
        identity: &Identity,
        now: Instant,
        step: &mut HandshakeStep,
    ) -> Result<(), HandshakeError> {
        let Some(peer_key) = self.peer_key.as_ref() else {
            step.need_lookup = true;
            return Ok(());
        };
        if self.encrypt_key.is_none() {
            let key = SessionKey::generate(Timestamp::now())?;
            let wrapped_key = wrap::wrap(peer_key.exchange_key(), key.material())?;
            let signature =
                identity.sign(&SetKey::signed_region(key.created(), &wrapped_key, &self.peer));
            self.set_key = Some(SetKey {
                sender_status: 0,
                creation: key.created(),
                wrapped_key,
                target: self.peer,
                signature,
            });
            self.encrypt_key = Some(key);
        }
        if self.state == HandshakeState::Down {
            self.state = HandshakeState::KeySent;
        }
        let (Some(set_key), Some(key)) = (self.set_key.as_mut(), self.encrypt_key.as_ref()) else {
            return Err(HandshakeError::NoSessionKey);
        };
        // The status is outside the signed region and tracks our progress.
        set_key.sender_status = self.state.code();
        let ping = Self::seal_ping(key, self.challenge, self.peer)?;

        let encoded = set_key.encode();
        let mut frame = BytesMut::with_capacity(encoded.len() + ping.len());
        frame.put_slice(&encoded);
        frame.put_slice(&ping);
        step.frames.push(frame.freeze());

        if self.state != HandshakeState::KeyConfirmed {
            self.schedule_retry(now);
        }
        debug!(peer = %self.peer, state = ?self.state, "sent SET_KEY and PING");
        Ok(())
    }

    fn schedule_retry(&mut self, now: Instant) {
        self.retry_at = now.checked_add(self.retry_interval);
    }

    fn seal_ping(key: &SessionKey, challenge: u32, target: PeerId) -> Result<Bytes, HandshakeError> {
        let header = wire::control_header(MessageKind::Ping)?;
        let payload = PingPayload { challenge, target }.encode();
        let (nonce, ciphertext) = key.seal_control(&header, &payload)?;
        Ok(wire::encode_control(&header, &nonce, &ciphertext))
    }

    fn answer_ping(
        &self,
        identity: &Identity,
        message: &Message<'_>,
        inbound_bpm: u32,
    ) -> Result<Bytes, HandshakeError> {
        let key = self.decrypt_key.as_ref().ok_or(HandshakeError::NoSessionKey)?;
        let (nonce, ciphertext) = wire::split_control(message)?;
        let plaintext = key.open_control(message.header, &nonce, ciphertext)?;
        let ping = PingPayload::parse(&plaintext)?;
        if ping.target != identity.id() {
            return Err(HandshakeError::WrongTarget(ping.target));
        }
        let header = wire::control_header(MessageKind::Pong)?;
        let payload = PongPayload {
            challenge: ping.challenge,
            inbound_bpm,
            target: identity.id(),
        }
        .encode();
        let (nonce, ciphertext) = key.seal_control(&header, &payload)?;
        Ok(wire::encode_control(&header, &nonce, &ciphertext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RETRY: Duration = Duration::from_secs(3);

    struct Side {
        identity: Identity,
        handshake: Handshake,
    }

    fn pair() -> (Side, Side) {
        let a = Identity::generate();
        let b = Identity::generate();
        let mut ha = Handshake::new(b.id(), RETRY);
        let mut hb = Handshake::new(a.id(), RETRY);
        let now = Instant::now();
        ha.on_lookup(&a, Some(b.public_key().clone()), now).expect("lookup a");
        hb.on_lookup(&b, Some(a.public_key().clone()), now).expect("lookup b");
        (
            Side { identity: a, handshake: ha },
            Side { identity: b, handshake: hb },
        )
    }

    /// Feeds every top-level message of `frames` into `side`, returning its replies.
    fn deliver(side: &mut Side, frames: &[Bytes], now: Instant) -> (Vec<Bytes>, HandshakeStep) {
        let mut replies = Vec::new();
        let mut summary = HandshakeStep::default();
        for frame in frames {
            for message in wire::messages(frame) {
                let message = message.expect("well formed");
                let step = match message.kind {
                    MessageKind::SetKey => side.handshake.on_set_key(&side.identity, message.body, now),
                    MessageKind::Ping => side.handshake.on_ping(&side.identity, &message, 4096),
                    MessageKind::Pong => side.handshake.on_pong(&message, now),
                    MessageKind::Encrypted => continue,
                }
                .expect("valid handshake message");
                summary.key_installed |= step.key_installed;
                summary.confirmed |= step.confirmed;
                summary.peer_bpm = step.peer_bpm.or(summary.peer_bpm);
                replies.extend(step.frames);
            }
        }
        (replies, summary)
    }

    #[test]
    fn lookup_sends_key_and_ping() {
        let a = Identity::generate();
        let b = Identity::generate();
        let mut hs = Handshake::new(b.id(), RETRY);
        let now = Instant::now();
        let step = hs.start(&a, now).expect("start");
        assert!(step.need_lookup);
        assert_eq!(hs.state(), HandshakeState::Down);

        let step = hs.on_lookup(&a, Some(b.public_key().clone()), now).expect("lookup");
        assert_eq!(step.frames.len(), 1);
        assert_eq!(step.frames[0].len(), wire::SET_KEY_LEN + wire::PING_LEN);
        assert_eq!(hs.state(), HandshakeState::KeySent);
        assert_eq!(hs.retry_at(), Some(now + RETRY));
    }

    #[test]
    fn sequential_open_confirms_both_sides() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let opening = a.handshake.start(&a.identity, now).expect("start").frames;

        let (to_a, b_step) = deliver(&mut b, &opening, now);
        assert!(b_step.key_installed);
        assert_eq!(b.handshake.state(), HandshakeState::KeyReceived);

        let (to_b, a_step) = deliver(&mut a, &to_a, now);
        assert!(a_step.confirmed);
        assert_eq!(a_step.peer_bpm, Some(4096));
        assert_eq!(a.handshake.state(), HandshakeState::KeyConfirmed);
        assert_eq!(a.handshake.retry_at(), None);

        let (rest, b_step) = deliver(&mut b, &to_b, now);
        assert!(b_step.confirmed);
        assert!(rest.is_empty());
        assert_eq!(b.handshake.state(), HandshakeState::KeyConfirmed);
    }

    #[test]
    fn simultaneous_open_installs_each_key_once() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let from_a = a.handshake.start(&a.identity, now).expect("a").frames;
        let from_b = b.handshake.start(&b.identity, now).expect("b").frames;

        let (a_replies, a_first) = deliver(&mut a, &from_b, now);
        let (b_replies, b_first) = deliver(&mut b, &from_a, now);
        assert!(a_first.key_installed && b_first.key_installed);
        // Both peers declared KeySent, so each re-sends its key once.
        let (a_more, a_second) = deliver(&mut a, &b_replies, now);
        let (b_more, b_second) = deliver(&mut b, &a_replies, now);
        assert!(!a_second.key_installed && !b_second.key_installed);

        deliver(&mut a, &b_more, now);
        deliver(&mut b, &a_more, now);
        assert_eq!(a.handshake.state(), HandshakeState::KeyConfirmed);
        assert_eq!(b.handshake.state(), HandshakeState::KeyConfirmed);
    }

    #[test]
    fn ping_before_key_is_answered_once_key_arrives() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let opening = a.handshake.start(&a.identity, now).expect("start").frames;
        let messages: Vec<_> = wire::messages(&opening[0]).map(|m| m.expect("ok")).collect();
        let set_key = messages[0];
        let ping = messages[1];

        let step = b.handshake.on_ping(&b.identity, &ping, 0).expect("buffered");
        assert!(step.frames.is_empty());

        let step = b.handshake.on_set_key(&b.identity, set_key.body, now).expect("set key");
        // Own SET_KEY+PING, then the PONG for the buffered PING.
        assert_eq!(step.frames.len(), 2);
        assert_eq!(step.frames[1].len(), wire::PONG_LEN);
    }

    #[test]
    fn tampered_set_key_is_rejected_without_state_change() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let opening = a.handshake.start(&a.identity, now).expect("start").frames;
        let mut frame = opening[0].to_vec();
        // Flip a byte inside the wrapped key, covered by the signature.
        frame[40] ^= 0x01;
        let set_key = wire::messages(&frame).next().expect("one").expect("ok");
        assert!(matches!(
            b.handshake.on_set_key(&b.identity, set_key.body, now),
            Err(HandshakeError::Signature(_))
        ));
        assert_eq!(b.handshake.state(), HandshakeState::Down);
        assert!(b.handshake.decrypt_key().is_none());
    }

    #[test]
    fn set_key_for_someone_else_is_rejected() {
        let (mut a, _b) = pair();
        let c = Identity::generate();
        let mut hc = Handshake::new(a.identity.id(), RETRY);
        let now = Instant::now();
        hc.on_lookup(&c, Some(a.identity.public_key().clone()), now).expect("lookup");
        let opening = a.handshake.start(&a.identity, now).expect("start").frames;
        let set_key = wire::messages(&opening[0]).next().expect("one").expect("ok");
        assert!(matches!(
            hc.on_set_key(&c, set_key.body, now),
            Err(HandshakeError::WrongTarget(_))
        ));
    }

    #[test]
    fn set_key_before_lookup_is_held() {
        let a = Identity::generate();
        let b = Identity::generate();
        let now = Instant::now();
        let mut ha = Handshake::new(b.id(), RETRY);
        let step = ha.on_lookup(&a, Some(b.public_key().clone()), now).expect("lookup");
        assert!(step.frames.is_empty());
        let opening = ha.start(&a, now).expect("start").frames;
        let set_key = wire::messages(&opening[0]).next().expect("one").expect("ok");

        let mut hb = Handshake::new(a.id(), RETRY);
        let step = hb.on_set_key(&b, set_key.body, now).expect("held");
        assert!(step.need_lookup);
        assert_eq!(hb.state(), HandshakeState::Down);

        let step = hb.on_lookup(&b, Some(a.public_key().clone()), now).expect("lookup");
        assert!(step.key_installed);
        assert_eq!(hb.state(), HandshakeState::KeyReceived);
    }

    #[test]
    fn retry_interval_doubles() {
        let (mut a, _b) = pair();
        let now = Instant::now();
        a.handshake.start(&a.identity, now).expect("start");
        let first = now + RETRY;
        assert_eq!(a.handshake.on_retry(&a.identity, first).expect("retry").frames.len(), 1);
        assert_eq!(a.handshake.retry_at(), Some(first + RETRY * 2));
        assert!(a.handshake.on_retry(&a.identity, first).expect("early").frames.is_empty());
    }

    #[test]
    fn wrong_challenge_does_not_confirm() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let opening = a.handshake.start(&a.identity, now).expect("start").frames;
        let (to_a, _) = deliver(&mut b, &opening, now);
        a.handshake.challenge = a.handshake.challenge.wrapping_add(1);
        let mut confirmed = false;
        for frame in &to_a {
            for message in wire::messages(frame) {
                let message = message.expect("ok");
                match message.kind {
                    MessageKind::SetKey => {
                        a.handshake.on_set_key(&a.identity, message.body, now).expect("set key");
                    }
                    MessageKind::Pong => {
                        let result = a.handshake.on_pong(&message, now);
                        assert!(matches!(result, Err(HandshakeError::ChallengeMismatch { .. })));
                        confirmed |= a.handshake.state() == HandshakeState::KeyConfirmed;
                    }
                    _ => {}
                }
            }
        }
        assert!(!confirmed);
    }

    /// SET_KEY from `from` to `to` carrying a fresh key created at `created`.
    fn signed_set_key(from: &Identity, to: &Identity, created: Timestamp) -> Bytes {
        let key = SessionKey::generate(created).expect("key");
        let wrapped_key = wrap::wrap(to.public_key().exchange_key(), key.material()).expect("wrap");
        let signature = from.sign(&SetKey::signed_region(created, &wrapped_key, &to.id()));
        SetKey {
            sender_status: HandshakeState::KeySent.code(),
            creation: created,
            wrapped_key,
            target: to.id(),
            signature,
        }
        .encode()
    }

    #[test]
    fn older_set_key_does_not_replace_installed_key() {
        let (mut a, mut b) = pair();
        let now = Instant::now();
        let opening = a.handshake.start(&a.identity, now).expect("start").frames;
        deliver(&mut b, &opening, now);
        assert_eq!(b.handshake.state(), HandshakeState::KeyReceived);
        let installed = b.handshake.decrypt_key().expect("installed").created();

        let older = signed_set_key(&a.identity, &b.identity, installed.saturating_sub(Duration::from_secs(1)));
        let message = wire::messages(&older).next().expect("one").expect("ok");
        assert!(matches!(
            b.handshake.on_set_key(&b.identity, message.body, now),
            Err(HandshakeError::StaleKey { .. })
        ));
        assert_eq!(b.handshake.decrypt_key().expect("kept").created(), installed);
        assert_eq!(b.handshake.state(), HandshakeState::KeyReceived);
    }

    #[test]
    fn failed_lookup_retries_with_growing_interval() {
        let a = Identity::generate();
        let b = Identity::generate();
        let mut hs = Handshake::new(b.id(), RETRY);
        let now = Instant::now();
        assert!(hs.start(&a, now).expect("start").need_lookup);

        let step = hs.on_lookup(&a, None, now).expect("failed lookup");
        assert!(step.frames.is_empty());
        assert_eq!(hs.retry_at(), Some(now + RETRY));
        assert_eq!(hs.state(), HandshakeState::Down);

        let first = now + RETRY;
        let step = hs.on_retry(&a, first).expect("retry");
        assert!(step.need_lookup);
        assert!(step.frames.is_empty());

        hs.on_lookup(&a, None, first).expect("failed again");
        assert_eq!(hs.retry_at(), Some(first + RETRY * 2));
    }

    #[test]
    fn lookup_returning_another_peers_key_is_rejected() {
        let a = Identity::generate();
        let b = Identity::generate();
        let c = Identity::generate();
        let mut hs = Handshake::new(b.id(), RETRY);
        let now = Instant::now();
        hs.start(&a, now).expect("start");

        let result = hs.on_lookup(&a, Some(c.public_key().clone()), now);
        assert!(matches!(result, Err(HandshakeError::KeyMismatch(id)) if id == c.id()));
        assert!(!hs.peer_key_known());
        assert_eq!(hs.state(), HandshakeState::Down);
        assert_eq!(hs.retry_at(), Some(now + RETRY));
    }

    /// Feeds `frame` into `side`, ignoring rejected messages.
    fn deliver_any(side: &mut Side, frame: &Bytes, now: Instant) -> Vec<Bytes> {
        let mut replies = Vec::new();
        for message in wire::messages(frame) {
            let Ok(message) = message else { continue };
            let step = match message.kind {
                MessageKind::SetKey => side.handshake.on_set_key(&side.identity, message.body, now),
                MessageKind::Ping => side.handshake.on_ping(&side.identity, &message, 4096),
                MessageKind::Pong => side.handshake.on_pong(&message, now),
                MessageKind::Encrypted => continue,
            };
            if let Ok(step) = step {
                replies.extend(step.frames);
            }
        }
        replies
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn state_never_moves_backwards(
            schedule in proptest::collection::vec((any::<bool>(), any::<u8>(), 0u8..4), 1..60),
        ) {
            let (mut a, mut b) = pair();
            let mut now = Instant::now();
            // inboxes[0] holds frames for a, inboxes[1] frames for b.
            let mut inboxes: [Vec<Bytes>; 2] = [Vec::new(), Vec::new()];
            inboxes[1].extend(a.handshake.start(&a.identity, now).expect("a").frames);
            inboxes[0].extend(b.handshake.start(&b.identity, now).expect("b").frames);
            let mut seen = [a.handshake.state(), b.handshake.state()];

            for (to_b, pick, action) in schedule {
                let (target, side) = if to_b { (1, &mut b) } else { (0, &mut a) };
                let replies = if action < 3 {
                    if inboxes[target].is_empty() {
                        continue;
                    }
                    // Frames stay in the inbox, so later picks duplicate and reorder them.
                    let frame = inboxes[target][pick as usize % inboxes[target].len()].clone();
                    deliver_any(side, &frame, now)
                } else {
                    now += RETRY * 4;
                    side.handshake.on_retry(&side.identity, now).map(|s| s.frames).unwrap_or_default()
                };
                let state = side.handshake.state();
                prop_assert!(state >= seen[target], "{:?} fell back to {:?}", seen[target], state);
                seen[target] = state;
                inboxes[1 - target].extend(replies);
            }
        }
    }
}
