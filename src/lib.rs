// Peercore public library surface.

/// Runtime-tunable limits, loaded from TOML or built in code.
pub mod config;

/// Wall-clock timestamps carried on the wire.
pub mod clock;

/// Identities, session keys and the primitives beneath them.
pub mod crypto;

/// Frame and message encodings.
pub mod wire;

/// Sliding window rejecting duplicate frame sequence numbers.
pub mod replay;

/// Deadline-ordered plaintext queue and frame batching.
pub mod sched;

/// Prometheus collectors.
pub mod metrics;

/// Types crossing the boundary to the transport, directory and submitters.
pub mod api;

/// SET_KEY / PING / PONG session establishment.
pub mod handshake;

/// Encrypted frames waiting for a transport send slot.
pub mod transmit;

/// Inbound frame validation and sub-message dispatch.
pub mod receive;

/// Local subscribers and their notification queues.
pub mod clients;

/// Splits the global inbound budget between connected peers.
pub mod quota;

/// Per-peer session state.
pub mod peer;

/// Sans-IO core owning every session.
pub mod context;

/// Tokio task driving a core and its transport.
#[cfg(feature = "runtime")]
pub mod runtime;

/// Configuration sections and their validation error.
pub use config::{
    BandwidthConfig, ClientConfig, Config, ConfigError, FrameConfig, HandshakeConfig, QueueConfig,
};

/// Millisecond wall-clock stamp.
pub use clock::Timestamp;

/// Key material, sizes and crypto failure types.
pub use crypto::{
    aead::{AeadError, TAG_LEN as AEAD_TAG_LEN, XCHACHA20_NONCE_LEN},
    hkdf::HkdfError,
    hmac::{IntegrityError, INTEGRITY_HASH_LEN},
    identity::{Identity, IdentityError, PeerId, PeerKey, PEER_ID_LEN, SIGNATURE_LEN},
    session::{SessionError, SessionKey},
    wrap::{WrapError, WRAPPED_KEY_LEN},
};

/// Message framing and parsing.
pub use wire::{
    messages, sub_messages, BodyHeader, Message, MessageKind, SetKey, SubMessage, WireError,
    MAX_MESSAGE_SIZE, SUB_HEADER_LEN,
};

/// Replay window.
pub use replay::{ReplayError, ReplayWindow, REPLAY_WINDOW_BITS};

/// Scheduler and its queue entries.
pub use sched::{
    window::BandwidthWindow, Admission, Batch, PendingMessage, Scheduler, SchedulerLimits,
    Selection,
};

/// Seams to the transport and directory, and message outcomes.
pub use api::{
    completion, Action, Completion, Directory, OutboundMessage, SendOutcome, SendTicket,
    Transport, TransportEvent, TransportResult,
};

/// Handshake progress and failures.
pub use handshake::{HandshakeError, HandshakeState, CONTROL_PRIORITY};

/// Reasons an inbound frame is dropped.
pub use receive::ReceiveError;

/// Client registrations and what they receive.
pub use clients::{ClientId, ClientInterest, Delivery, Notification};

/// Inbound quota distribution.
pub use quota::{Distributor, QuotaLimits, QuotaUpdate};

/// Per-peer status reports.
pub use peer::{PeerSnapshot, PeerStatistics};

/// The core itself.
pub use context::CoreContext;

/// Tokio runtime shell and its handle.
#[cfg(feature = "runtime")]
pub use runtime::{
    spawn_core, spawn_core_with_config, ClientSubscription, CoreHandle, CoreHandleError,
    CoreStopReason, RuntimeConfig, RuntimeEvent,
};

/// Metrics registry.
pub use metrics::{Metrics, MetricsError};
