// api.rs - boundary types shared with transports, directories and local clients
use std::{
    fmt,
    future::Future,
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::crypto::identity::{PeerId, PeerKey};

/// Final outcome reported to whoever submitted a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the transport inside a frame of `bytes` bytes.
    Transmitted { bytes: usize },
    /// Deadline plus grace passed before the message was selected.
    Expired,
    /// Pushed out of a full queue by a more important message.
    Evicted,
    /// Not admitted to a full queue.
    Rejected,
    /// Cannot fit in a single frame.
    TooLarge,
    /// The transport gave up on the frame carrying the message.
    TransportDropped,
    /// The peer went away, or was never connected.
    Disconnected,
}

impl fmt::Display for SendOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendOutcome::Transmitted { bytes } => write!(f, "transmitted in {bytes} byte frame"),
            SendOutcome::Expired => f.write_str("expired"),
            SendOutcome::Evicted => f.write_str("evicted"),
            SendOutcome::Rejected => f.write_str("rejected"),
            SendOutcome::TooLarge => f.write_str("too large"),
            SendOutcome::TransportDropped => f.write_str("dropped by transport"),
            SendOutcome::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Continuation fired exactly once with the fate of a message.
pub type Completion = oneshot::Sender<SendOutcome>;

/// Creates a completion pair.
pub fn completion() -> (Completion, oneshot::Receiver<SendOutcome>) {
    oneshot::channel()
}

/// Application traffic submitted for a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Sub-message type used by receivers to route the payload.
    pub msg_type: u16,
    pub payload: Bytes,
    /// Higher is more important.
    pub priority: u32,
    pub deadline: Instant,
}

impl OutboundMessage {
    pub fn new(msg_type: u16, payload: impl Into<Bytes>, priority: u32, deadline: Instant) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
            priority,
            deadline,
        }
    }
}

/// Identifies one outstanding send-slot request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendTicket(pub u64);

/// Work the core asks its driver to perform on external collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Ask the transport to call back with a buffer of at least `max_size` bytes.
    RequestSendSlot {
        peer: PeerId,
        ticket: SendTicket,
        max_size: usize,
        priority: u32,
        /// Remaining time until the head frame's deadline.
        deadline: Duration,
    },
    /// Withdraw a previous request; no callback must follow.
    CancelSendSlot { peer: PeerId, ticket: SendTicket },
    /// Tell the transport how much the peer may send us.
    SetReceiveQuota { peer: PeerId, bpm: u32 },
    /// Resolve a peer identity to its long-term public key.
    LookupPublicKey { peer: PeerId, timeout: Duration },
    /// Abandon a running lookup.
    CancelLookup { peer: PeerId },
}

/// Events yielded by [`Transport::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    /// One transport frame from `peer`.
    Received { peer: PeerId, frame: Bytes },
    /// A send slot granted for `ticket`; the transport accepts up to `capacity` bytes.
    SendReady {
        peer: PeerId,
        ticket: SendTicket,
        capacity: usize,
    },
    /// The transport could not honour the request for `ticket`.
    SendFailed { peer: PeerId, ticket: SendTicket },
}

/// Result alias used within transport operations.
pub type TransportResult<T, E> = Result<T, E>;

/// Message-oriented transport the runtime shell drives the core against.
pub trait Transport {
    /// Error type returned by the transport.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Polls for transport events.
    fn poll(&mut self) -> TransportResult<Option<TransportEvent>, Self::Error>;

    /// Requests a later [`TransportEvent::SendReady`] or [`TransportEvent::SendFailed`] for `ticket`.
    fn request_send_slot(
        &mut self,
        peer: &PeerId,
        ticket: SendTicket,
        max_size: usize,
        priority: u32,
        deadline: Duration,
    ) -> TransportResult<(), Self::Error>;

    fn cancel_send_slot(&mut self, peer: &PeerId, ticket: SendTicket) -> TransportResult<(), Self::Error>;

    /// Sends a frame previously granted a slot.
    fn transmit(&mut self, peer: &PeerId, frame: Bytes) -> TransportResult<(), Self::Error>;

    fn set_receive_quota(&mut self, peer: &PeerId, bpm: u32) -> TransportResult<(), Self::Error>;
}

/// Directory resolving peer identities to long-term public keys.
///
/// The runtime shell runs every lookup on its own task and aborts it when the
/// session that asked goes away.
pub trait Directory: Send + Sync + 'static {
    /// Resolves `peer`; `None` is a definitive miss for this attempt.
    fn lookup_public_key(
        &self,
        peer: PeerId,
        timeout: Duration,
    ) -> impl Future<Output = Option<PeerKey>> + Send;
}
