// context.rs - peer registry and event entry points of the messaging core
use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use ahash::AHashMap;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::{
    api::{Action, Completion, OutboundMessage, SendOutcome, SendTicket},
    clients::{ClientId, ClientInterest, ClientRegistry, Notification},
    config::{Config, ConfigError},
    crypto::identity::{Identity, PeerId, PeerKey},
    handshake::HandshakeState,
    metrics::Metrics,
    peer::{PeerSession, PeerSnapshot, SessionIo, SessionSettings},
    quota::{Distributor, QuotaInput},
};

/// All state of the core, driven by a single event loop.
///
/// Every entry point takes the current [`Instant`]; work for the outside world
/// is queued as [`Action`]s and drained with [`CoreContext::poll_action`].
#[derive(Debug)]
pub struct CoreContext {
    identity: Identity,
    config: Config,
    settings: SessionSettings,
    peers: AHashMap<PeerId, PeerSession>,
    clients: ClientRegistry,
    distributor: Distributor,
    actions: VecDeque<Action>,
    next_ticket: u64,
    quota_period: Duration,
    next_quota: Instant,
    metrics: Arc<Metrics>,
}

impl CoreContext {
    /// Builds the core; only local misconfiguration is fatal.
    pub fn init(identity: Identity, config: Config, metrics: Arc<Metrics>, now: Instant) -> Result<Self, ConfigError> {
        config.validate()?;
        let quota_period = config.bandwidth.quota_period();
        info!(local = %identity.id(), "peer core initialised");
        Ok(Self {
            settings: SessionSettings::from(&config),
            clients: ClientRegistry::new(config.clients.max_notify_queue),
            distributor: Distributor::new(config.quota_limits()),
            identity,
            config,
            peers: AHashMap::default(),
            actions: VecDeque::new(),
            next_ticket: 0,
            quota_period,
            next_quota: now + quota_period,
            metrics,
        })
    }

    pub fn local_id(&self) -> PeerId {
        self.identity.id()
    }

    pub fn public_key(&self) -> &PeerKey {
        self.identity.public_key()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> + '_ {
        self.peers.keys()
    }

    pub fn state(&self, peer: &PeerId) -> Option<HandshakeState> {
        self.peers.get(peer).map(PeerSession::state)
    }

    /// Transport reported a new connection; starts the key exchange.
    pub fn on_connect(&mut self, peer: PeerId, now: Instant) {
        if peer == self.identity.id() {
            warn!(%peer, "transport connected us to ourselves, ignoring");
            return;
        }
        if self.peers.contains_key(&peer) {
            debug!(%peer, "duplicate connect notification");
            return;
        }
        let session = PeerSession::new(peer, self.settings, Arc::clone(&self.metrics), now);
        self.peers.insert(peer, session);
        self.distributor.add_peer(peer);
        self.metrics.connected_peers.set(self.peers.len() as i64);
        debug!(%peer, "peer connected");
        self.with_session(&peer, |session, io| session.start(io, now));
    }

    /// Transport reported the connection gone; fails everything still queued.
    pub fn on_disconnect(&mut self, peer: &PeerId) {
        let Some(mut session) = self.peers.remove(peer) else {
            debug!(%peer, "disconnect for unknown peer");
            return;
        };
        self.distributor.remove_peer(peer);
        self.metrics.connected_peers.set(self.peers.len() as i64);
        let mut io = SessionIo {
            identity: &self.identity,
            clients: &mut self.clients,
            actions: &mut self.actions,
            next_ticket: &mut self.next_ticket,
        };
        session.close(&mut io);
    }

    pub fn on_receive(&mut self, peer: &PeerId, frame: &[u8], now: Instant) {
        if self
            .with_session(peer, |session, io| session.on_receive(io, frame, now))
            .is_none()
        {
            debug!(%peer, len = frame.len(), "frame from unknown peer dropped");
        }
    }

    /// Transport granted (`Some`) or refused (`None`) the slot for `ticket`.
    pub fn on_send_ready(
        &mut self,
        peer: &PeerId,
        ticket: SendTicket,
        buffer: Option<&mut [u8]>,
        now: Instant,
    ) -> usize {
        self.with_session(peer, |session, io| session.on_send_ready(io, ticket, buffer, now))
            .unwrap_or(0)
    }

    pub fn on_lookup_complete(&mut self, peer: &PeerId, key: Option<PeerKey>, now: Instant) {
        self.with_session(peer, |session, io| session.on_lookup(io, key, now));
    }

    pub fn poll_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    /// Earliest instant at which [`CoreContext::handle_timeout`] has work.
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.peers
            .values()
            .filter_map(PeerSession::next_timeout)
            .chain(std::iter::once(self.next_quota))
            .min()
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        for session in self.peers.values_mut() {
            if session.next_timeout().map_or(false, |at| at <= now) {
                let mut io = SessionIo {
                    identity: &self.identity,
                    clients: &mut self.clients,
                    actions: &mut self.actions,
                    next_ticket: &mut self.next_ticket,
                };
                session.handle_timeout(&mut io, now);
            }
        }
        if self.next_quota <= now {
            self.redistribute(now);
            self.next_quota = now + self.quota_period;
        }
    }

    /// Registers a client and tells it about every peer already confirmed.
    pub fn register_client(&mut self, interest: ClientInterest) -> ClientId {
        let id = self.clients.register(interest);
        for session in self.peers.values() {
            if session.state() == HandshakeState::KeyConfirmed {
                self.clients
                    .push(id, Notification::Connected { peer: session.id() });
            }
        }
        debug!(client = %id, "client registered");
        id
    }

    pub fn unregister_client(&mut self, id: ClientId) -> bool {
        self.clients.unregister(id)
    }

    pub fn poll_notification(&mut self, id: ClientId) -> Option<Notification> {
        self.clients.poll(id)
    }

    pub fn requeue_notification(&mut self, id: ClientId, notification: Notification) {
        self.clients.requeue_front(id, notification);
    }

    /// Queues a message for `peer`. The outcome only ever reaches `completion`.
    pub fn submit(
        &mut self,
        peer: &PeerId,
        message: OutboundMessage,
        completion: Option<Completion>,
        now: Instant,
    ) {
        let Some(session) = self.peers.get_mut(peer) else {
            debug!(%peer, msg_type = message.msg_type, "submit to unconnected peer");
            if let Some(tx) = completion {
                let _ = tx.send(SendOutcome::Disconnected);
            }
            return;
        };
        let mut io = SessionIo {
            identity: &self.identity,
            clients: &mut self.clients,
            actions: &mut self.actions,
            next_ticket: &mut self.next_ticket,
        };
        session.submit(&mut io, message, completion, now);
    }

    /// Convenience wrapper around [`CoreContext::submit`] for raw payloads.
    pub fn send(&mut self, peer: &PeerId, msg_type: u16, payload: Bytes, priority: u32, deadline: Instant, now: Instant) {
        self.submit(peer, OutboundMessage::new(msg_type, payload, priority, deadline), None, now);
    }

    pub fn increase_preference(&mut self, peer: &PeerId, delta: u64) -> bool {
        self.distributor.increase_preference(peer, delta)
    }

    pub fn set_outbound_limit(&mut self, peer: &PeerId, bpm: u32, now: Instant) -> bool {
        self.with_session(peer, |session, io| session.set_outbound_limit(io, bpm, now))
            .is_some()
    }

    pub fn snapshot(&self, peer: &PeerId, now: Instant) -> Option<PeerSnapshot> {
        let preference = self.distributor.preference(peer).unwrap_or(0);
        self.peers
            .get(peer)
            .map(|session| session.snapshot(now, preference))
    }

    /// Closes every session; pending cancellations stay in the action queue.
    pub fn teardown(&mut self) {
        let sessions: Vec<PeerSession> = self.peers.drain().map(|(_, session)| session).collect();
        for mut session in sessions {
            self.distributor.remove_peer(&session.id());
            let mut io = SessionIo {
                identity: &self.identity,
                clients: &mut self.clients,
                actions: &mut self.actions,
                next_ticket: &mut self.next_ticket,
            };
            session.close(&mut io);
        }
        self.metrics.connected_peers.set(0);
        info!(local = %self.identity.id(), "peer core torn down");
    }

    fn redistribute(&mut self, now: Instant) {
        let inputs: Vec<QuotaInput> = self.peers.values().map(PeerSession::quota_input).collect();
        for update in self.distributor.distribute(&inputs, now) {
            let Some(session) = self.peers.get_mut(&update.peer) else {
                continue;
            };
            debug!(peer = %update.peer, from = session.inbound_bpm(), to = update.bpm, "receive quota changed");
            session.set_inbound_bpm(update.bpm);
            self.actions.push_back(Action::SetReceiveQuota {
                peer: update.peer,
                bpm: update.bpm,
            });
            self.metrics.quota_updates.inc();
        }
    }

    fn with_session<R>(
        &mut self,
        peer: &PeerId,
        f: impl FnOnce(&mut PeerSession, &mut SessionIo<'_>) -> R,
    ) -> Option<R> {
        let session = self.peers.get_mut(peer)?;
        let mut io = SessionIo {
            identity: &self.identity,
            clients: &mut self.clients,
            actions: &mut self.actions,
            next_ticket: &mut self.next_ticket,
        };
        Some(f(session, &mut io))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::completion, clients::Delivery};

    fn core(now: Instant) -> CoreContext {
        let metrics = Arc::new(Metrics::new().expect("metrics"));
        CoreContext::init(Identity::generate(), Config::default(), metrics, now).expect("init")
    }

    /// Executes `from`'s actions against `to`, returning frames that crossed the wire.
    fn step(from: &mut CoreContext, to: &mut CoreContext, now: Instant) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Some(action) = from.poll_action() {
            match action {
                Action::RequestSendSlot { peer, ticket, max_size, .. } => {
                    let mut buf = vec![0u8; max_size];
                    let written = from.on_send_ready(&peer, ticket, Some(&mut buf), now);
                    buf.truncate(written);
                    if written > 0 {
                        to.on_receive(&from.local_id(), &buf, now);
                        frames.push(buf);
                    }
                }
                Action::LookupPublicKey { peer, .. } => {
                    let key = to.public_key().clone();
                    from.on_lookup_complete(&peer, Some(key), now);
                }
                _ => {}
            }
        }
        frames
    }

    fn pump(a: &mut CoreContext, b: &mut CoreContext, now: Instant) {
        for _ in 0..16 {
            let sent = step(a, b, now).len() + step(b, a, now).len();
            if sent == 0 && a.actions.is_empty() && b.actions.is_empty() {
                break;
            }
        }
    }

    fn connected(now: Instant) -> (CoreContext, CoreContext) {
        let mut a = core(now);
        let mut b = core(now);
        a.on_connect(b.local_id(), now);
        b.on_connect(a.local_id(), now);
        pump(&mut a, &mut b, now);
        (a, b)
    }

    #[test]
    fn simultaneous_open_confirms_both_sides() {
        let now = Instant::now();
        let (a, b) = connected(now);
        assert_eq!(a.state(&b.local_id()), Some(HandshakeState::KeyConfirmed));
        assert_eq!(b.state(&a.local_id()), Some(HandshakeState::KeyConfirmed));
        let snap = a.snapshot(&b.local_id(), now).expect("snapshot");
        assert_eq!(snap.stats.protocol_violations, 0);
        assert_eq!(snap.external_out_bpm, b.config().bandwidth.default_bpm);
    }

    #[test]
    fn late_client_learns_about_confirmed_peers() {
        let now = Instant::now();
        let (mut a, b) = connected(now);
        let client = a.register_client(ClientInterest::default());
        assert_eq!(
            a.poll_notification(client),
            Some(Notification::Connected { peer: b.local_id() })
        );
        assert_eq!(a.poll_notification(client), None);
    }

    #[test]
    fn messages_reach_interested_clients() {
        let now = Instant::now();
        let (mut a, mut b) = connected(now);
        let client = b.register_client(ClientInterest::types([3, 4]));
        b.poll_notification(client);

        let later = now + Duration::from_millis(500);
        let (tx, mut rx) = completion();
        a.submit(&b.local_id(), OutboundMessage::new(3, &b"late"[..], 1, later), Some(tx), now);
        a.send(&b.local_id(), 4, Bytes::from_static(b"early"), 1, now, now);
        pump(&mut a, &mut b, now);

        assert!(matches!(rx.try_recv(), Ok(SendOutcome::Transmitted { .. })));
        let mut types = Vec::new();
        while let Some(Notification::Inbound { msg_type, .. }) = b.poll_notification(client) {
            types.push(msg_type);
        }
        assert_eq!(types.len(), 2);
        assert!(types.contains(&3) && types.contains(&4));
    }

    #[test]
    fn replayed_frame_is_delivered_once() {
        let now = Instant::now();
        let (mut a, mut b) = connected(now);
        let client = b.register_client(ClientInterest::default().with_inbound(Delivery::Headers));
        b.poll_notification(client);

        a.send(&b.local_id(), 9, Bytes::from_static(b"once"), 1, now, now);
        let frames = step(&mut a, &mut b, now);
        assert_eq!(frames.len(), 1);
        b.on_receive(&a.local_id(), &frames[0], now);

        assert!(matches!(b.poll_notification(client), Some(Notification::Inbound { .. })));
        assert_eq!(b.poll_notification(client), None);
        assert_eq!(b.metrics().replay_drops.get(), 1);
    }

    #[test]
    fn submit_to_unknown_peer_reports_disconnect() {
        let now = Instant::now();
        let mut a = core(now);
        let (tx, mut rx) = completion();
        let stranger = Identity::generate().id();
        a.submit(&stranger, OutboundMessage::new(1, &b"x"[..], 1, now), Some(tx), now);
        assert_eq!(rx.try_recv(), Ok(SendOutcome::Disconnected));
    }

    #[test]
    fn disconnect_fails_queued_messages_and_notifies() {
        let now = Instant::now();
        let mut a = core(now);
        let b = core(now);
        a.on_connect(b.local_id(), now);
        let client = a.register_client(ClientInterest::default());
        let (tx, mut rx) = completion();
        let deadline = now + Duration::from_secs(5);
        a.submit(&b.local_id(), OutboundMessage::new(1, &b"x"[..], 1, deadline), Some(tx), now);
        a.on_disconnect(&b.local_id());

        assert_eq!(rx.try_recv(), Ok(SendOutcome::Disconnected));
        assert!(a
            .actions
            .iter()
            .any(|action| matches!(action, Action::CancelLookup { .. })));
        // Never confirmed, so clients never heard of it.
        assert_eq!(a.poll_notification(client), None);
        assert_eq!(a.peer_count(), 0);
    }

    #[test]
    fn quota_period_pushes_preference_weighted_quota() {
        let now = Instant::now();
        let (mut a, b) = connected(now);
        while a.poll_action().is_some() {}
        let peer = b.local_id();
        let limits = a.config().quota_limits();

        let first = a.poll_timeout().expect("timer");
        a.handle_timeout(first);
        let min = limits.min_bpm_per_peer;
        assert!(a.actions.contains(&Action::SetReceiveQuota { peer, bpm: min }));
        while a.poll_action().is_some() {}

        assert!(a.increase_preference(&peer, 9));
        let second = first + a.config().bandwidth.quota_period();
        a.handle_timeout(second);
        let distributable = (limits.global_target_bpm - min) as u64;
        let expected = min + (distributable * 9 / 10) as u32;
        assert!(a.actions.contains(&Action::SetReceiveQuota { peer, bpm: expected }));
        assert_eq!(a.snapshot(&peer, second).expect("snapshot").inbound_bpm, expected);
        assert_eq!(a.snapshot(&peer, second).expect("snapshot").preference, 9);
    }

    #[test]
    fn teardown_closes_every_session() {
        let now = Instant::now();
        let (mut a, b) = connected(now);
        let client = a.register_client(ClientInterest::default());
        a.poll_notification(client);
        a.teardown();
        assert_eq!(a.peer_count(), 0);
        assert_eq!(
            a.poll_notification(client),
            Some(Notification::Disconnected { peer: b.local_id() })
        );
        assert_eq!(a.metrics().connected_peers.get(), 0);
    }
}
