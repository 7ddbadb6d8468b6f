// clients.rs - local client registrations and their bounded notification queues
use std::{collections::VecDeque, fmt};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;

use crate::crypto::identity::PeerId;

/// Handle returned by [`ClientRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// How much of every message in one direction a client wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Delivery {
    #[default]
    Off,
    Headers,
    Full,
}

/// What a client registered for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientInterest {
    /// Inbound types delivered with full payload.
    pub types: AHashSet<u16>,
    /// Delivery of inbound messages outside `types`.
    pub inbound: Delivery,
    /// Delivery of messages we batch for transmission.
    pub outbound: Delivery,
}

impl ClientInterest {
    pub fn types(types: impl IntoIterator<Item = u16>) -> Self {
        Self {
            types: types.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn with_inbound(mut self, delivery: Delivery) -> Self {
        self.inbound = delivery;
        self
    }

    pub fn with_outbound(mut self, delivery: Delivery) -> Self {
        self.outbound = delivery;
        self
    }

    fn inbound_for(&self, msg_type: u16) -> Delivery {
        if self.types.contains(&msg_type) {
            Delivery::Full
        } else {
            self.inbound
        }
    }
}

/// Notification pushed to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Connected { peer: PeerId },
    Disconnected { peer: PeerId },
    /// Sub-message received from `peer`; `payload` is `None` for header-only delivery.
    Inbound {
        peer: PeerId,
        msg_type: u16,
        size: u16,
        payload: Option<Bytes>,
    },
    /// Sub-message batched for `peer`.
    Outbound {
        peer: PeerId,
        msg_type: u16,
        size: u16,
        payload: Option<Bytes>,
    },
}

impl Notification {
    /// Connection changes are never dropped.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Notification::Connected { .. } | Notification::Disconnected { .. }
        )
    }
}

#[derive(Debug)]
struct ClientEntry {
    interest: ClientInterest,
    queue: VecDeque<Notification>,
}

/// Registered clients keyed by id.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: AHashMap<ClientId, ClientEntry>,
    next_id: u64,
    max_queue: usize,
}

impl ClientRegistry {
    pub fn new(max_queue: usize) -> Self {
        Self {
            clients: AHashMap::default(),
            next_id: 1,
            max_queue,
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn register(&mut self, interest: ClientInterest) -> ClientId {
        let id = ClientId(self.next_id);
        self.next_id += 1;
        self.clients.insert(
            id,
            ClientEntry {
                interest,
                queue: VecDeque::new(),
            },
        );
        id
    }

    pub fn unregister(&mut self, id: ClientId) -> bool {
        self.clients.remove(&id).is_some()
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn queue_len(&self, id: ClientId) -> usize {
        self.clients.get(&id).map_or(0, |entry| entry.queue.len())
    }

    pub fn poll(&mut self, id: ClientId) -> Option<Notification> {
        self.clients.get_mut(&id)?.queue.pop_front()
    }

    /// Puts back a notification its consumer could not take yet.
    pub fn requeue_front(&mut self, id: ClientId, notification: Notification) {
        if let Some(entry) = self.clients.get_mut(&id) {
            entry.queue.push_front(notification);
        }
    }

    /// Queues for one client; returns false when a non-critical notification was dropped.
    pub fn push(&mut self, id: ClientId, notification: Notification) -> bool {
        let max_queue = self.max_queue;
        match self.clients.get_mut(&id) {
            Some(entry) => Self::enqueue(entry, max_queue, notification),
            None => false,
        }
    }

    /// Queues for every client; returns how many copies were dropped.
    pub fn broadcast(&mut self, notification: Notification) -> usize {
        let max_queue = self.max_queue;
        let mut dropped = 0;
        for entry in self.clients.values_mut() {
            if !Self::enqueue(entry, max_queue, notification.clone()) {
                dropped += 1;
            }
        }
        dropped
    }

    /// Routes an inbound sub-message; returns how many copies were dropped.
    pub fn deliver_inbound(&mut self, peer: PeerId, msg_type: u16, size: u16, payload: &[u8]) -> usize {
        let max_queue = self.max_queue;
        let mut shared: Option<Bytes> = None;
        let mut dropped = 0;
        for entry in self.clients.values_mut() {
            let payload = match entry.interest.inbound_for(msg_type) {
                Delivery::Off => continue,
                Delivery::Headers => None,
                Delivery::Full => Some(
                    shared
                        .get_or_insert_with(|| Bytes::copy_from_slice(payload))
                        .clone(),
                ),
            };
            let notification = Notification::Inbound {
                peer,
                msg_type,
                size,
                payload,
            };
            if !Self::enqueue(entry, max_queue, notification) {
                dropped += 1;
            }
        }
        dropped
    }

    /// Tells outbound monitors about a batched sub-message; returns drops.
    pub fn deliver_outbound(&mut self, peer: PeerId, msg_type: u16, size: u16, payload: &Bytes) -> usize {
        let max_queue = self.max_queue;
        let mut dropped = 0;
        for entry in self.clients.values_mut() {
            let payload = match entry.interest.outbound {
                Delivery::Off => continue,
                Delivery::Headers => None,
                Delivery::Full => Some(payload.clone()),
            };
            let notification = Notification::Outbound {
                peer,
                msg_type,
                size,
                payload,
            };
            if !Self::enqueue(entry, max_queue, notification) {
                dropped += 1;
            }
        }
        dropped
    }

    fn enqueue(entry: &mut ClientEntry, max_queue: usize, notification: Notification) -> bool {
        if entry.queue.len() >= max_queue && !notification.is_critical() {
            return false;
        }
        entry.queue.push_back(notification);
        true
    }
}
