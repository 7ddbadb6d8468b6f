// receive.rs - opens encrypted frames and enforces replay and freshness rules
use std::time::Duration;

use thiserror::Error;

use crate::{
    clock::Timestamp,
    crypto::session::{SessionError, SessionKey},
    replay::{ReplayError, ReplayWindow},
    wire::{self, BodyHeader, Message, SubMessages, WireError, BODY_HEADER_LEN},
};

/// Why an inbound encrypted frame was dropped.
#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("no decrypt key installed")]
    NoKey,
    #[error("malformed frame: {0}")]
    Wire(#[from] WireError),
    #[error("frame failed to open: {0}")]
    Crypto(#[from] SessionError),
    #[error("{0}")]
    Replay(#[from] ReplayError),
    #[error("frame stamped {stamp:?} is {age:?} old")]
    Stale { stamp: Timestamp, age: Duration },
}

impl ReceiveError {
    /// Short label for the drop counter.
    pub fn kind(&self) -> &'static str {
        match self {
            ReceiveError::NoKey => "no_key",
            ReceiveError::Wire(_) => "malformed",
            ReceiveError::Crypto(_) => "integrity",
            ReceiveError::Replay(_) => "replay",
            ReceiveError::Stale { .. } => "stale",
        }
    }
}

/// Decrypted body of an accepted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedFrame {
    pub header: BodyHeader,
    body: Vec<u8>,
}

impl OpenedFrame {
    /// Concatenated sub-messages following the body header.
    pub fn payload(&self) -> &[u8] {
        &self.body[BODY_HEADER_LEN..]
    }

    pub fn sub_messages(&self) -> SubMessages<'_> {
        wire::sub_messages(self.payload())
    }
}

/// Decrypts `message`, checks its integrity hash, sequence number and age.
///
/// The replay window only advances for frames that decrypt and verify.
pub fn open_frame(
    key: Option<&SessionKey>,
    replay: &mut ReplayWindow,
    message: &Message<'_>,
    now: Timestamp,
    max_age: Duration,
) -> Result<OpenedFrame, ReceiveError> {
    let key = key.ok_or(ReceiveError::NoKey)?;
    let (hash, ciphertext) = wire::split_encrypted(message)?;
    let body = key.open_body(message.header, hash, ciphertext)?;
    let (header, _) = BodyHeader::parse(&body)?;
    replay.check_and_insert(header.seq)?;
    let age = header.timestamp.age(now);
    if age > max_age {
        return Err(ReceiveError::Stale {
            stamp: header.timestamp,
            age,
        });
    }
    Ok(OpenedFrame { header, body })
}
