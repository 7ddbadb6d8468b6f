// Wire format: top-level message headers, SET_KEY, PING/PONG, encrypted bodies and sub-messages.
// wire.rs

use std::convert::TryFrom;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    clock::Timestamp,
    crypto::{
        aead::{Nonce, TAG_LEN, XCHACHA20_NONCE_LEN},
        hmac::INTEGRITY_HASH_LEN,
        identity::{PeerId, PEER_ID_LEN, SIGNATURE_LEN},
        wrap::WRAPPED_KEY_LEN,
    },
};

/// Length of every top-level message header (`type u16 | size u16`).
pub const MESSAGE_HEADER_LEN: usize = 4;

/// Largest encodable top-level message or sub-message.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// Length of a sub-message header (`size u16 | type u16`).
pub const SUB_HEADER_LEN: usize = 4;

/// Decrypted body prefix: sequence number, declared inbound bpm, timestamp.
pub const BODY_HEADER_LEN: usize = 16;

/// Bytes an encrypted frame adds on top of its sub-messages.
pub const ENCRYPTED_OVERHEAD: usize = MESSAGE_HEADER_LEN + INTEGRITY_HASH_LEN + BODY_HEADER_LEN + TAG_LEN;

/// Signature purpose tag for SET_KEY ("SETK").
pub const SET_KEY_PURPOSE: u32 = 0x5345_544b;

/// Signed region of SET_KEY: purpose, purpose size, creation time, wrapped key, target.
pub const SET_KEY_SIGNED_LEN: usize = 4 + 4 + 8 + WRAPPED_KEY_LEN + PEER_ID_LEN;

/// Full SET_KEY message including header and sender status.
pub const SET_KEY_LEN: usize = MESSAGE_HEADER_LEN + 4 + SET_KEY_SIGNED_LEN + SIGNATURE_LEN;

const PING_PLAIN_LEN: usize = 4 + PEER_ID_LEN;
const PONG_PLAIN_LEN: usize = 4 + 4 + PEER_ID_LEN;

/// Full PING message length.
pub const PING_LEN: usize = MESSAGE_HEADER_LEN + XCHACHA20_NONCE_LEN + PING_PLAIN_LEN + TAG_LEN;

/// Full PONG message length.
pub const PONG_LEN: usize = MESSAGE_HEADER_LEN + XCHACHA20_NONCE_LEN + PONG_PLAIN_LEN + TAG_LEN;

/// Wire-level error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than required.
    #[error("buffer too short: expected at least {expected} bytes, got {actual}")]
    BufferTooShort { expected: usize, actual: usize },

    /// Declared size is smaller than its header or overruns the buffer.
    #[error("declared size {declared} invalid for {available} available bytes")]
    InvalidSize { declared: usize, available: usize },

    /// Unknown top-level message type.
    #[error("unknown message type {0}")]
    UnknownKind(u16),

    /// Message length does not match its type.
    #[error("{kind:?} must be {expected} bytes, got {actual}")]
    LengthMismatch {
        kind: MessageKind,
        expected: usize,
        actual: usize,
    },

    /// SET_KEY carried an unexpected signature purpose or purpose size.
    #[error("bad signature purpose {purpose:#010x} (size {size})")]
    BadPurpose { purpose: u32, size: u32 },

    /// Payload too large to encode.
    #[error("message of {0} bytes exceeds encodable size")]
    Oversized(usize),
}

/// Top-level message types.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SetKey = 1,
    Ping = 2,
    Pong = 3,
    Encrypted = 4,
}

impl TryFrom<u16> for MessageKind {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::SetKey),
            2 => Ok(MessageKind::Ping),
            3 => Ok(MessageKind::Pong),
            4 => Ok(MessageKind::Encrypted),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

/// Encodes a top-level header for a message of `size` bytes (header included).
pub fn message_header(kind: MessageKind, size: usize) -> Result<[u8; MESSAGE_HEADER_LEN], WireError> {
    let size = u16::try_from(size).map_err(|_| WireError::Oversized(size))?;
    let mut out = [0u8; MESSAGE_HEADER_LEN];
    out[..2].copy_from_slice(&(kind as u16).to_be_bytes());
    out[2..].copy_from_slice(&size.to_be_bytes());
    Ok(out)
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(buf)
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[at..at + 8]);
    u64::from_be_bytes(buf)
}

fn read_peer_id(bytes: &[u8], at: usize) -> PeerId {
    let mut buf = [0u8; PEER_ID_LEN];
    buf.copy_from_slice(&bytes[at..at + PEER_ID_LEN]);
    PeerId::from_bytes(buf)
}

/// One top-level message inside a transport frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Message<'a> {
    pub kind: MessageKind,
    /// The 4-byte header, used as AAD for sealed sections.
    pub header: &'a [u8],
    /// Everything after the header.
    pub body: &'a [u8],
}

impl Message<'_> {
    pub fn size(&self) -> usize {
        self.header.len() + self.body.len()
    }
}

/// Iterates the top-level messages packed back to back in a frame.
///
/// Yields one error and then stops when a header is malformed.
#[derive(Debug, Clone)]
pub struct Messages<'a> {
    rest: &'a [u8],
    failed: bool,
}

pub fn messages(frame: &[u8]) -> Messages<'_> {
    Messages {
        rest: frame,
        failed: false,
    }
}

impl<'a> Iterator for Messages<'a> {
    type Item = Result<Message<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        let result = split_message(self.rest);
        match result {
            Ok((message, rest)) => {
                self.rest = rest;
                Some(Ok(message))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn split_message(bytes: &[u8]) -> Result<(Message<'_>, &[u8]), WireError> {
    if bytes.len() < MESSAGE_HEADER_LEN {
        return Err(WireError::BufferTooShort {
            expected: MESSAGE_HEADER_LEN,
            actual: bytes.len(),
        });
    }
    let kind_raw = read_u16(bytes, 0);
    let size = read_u16(bytes, 2) as usize;
    if size < MESSAGE_HEADER_LEN || size > bytes.len() {
        return Err(WireError::InvalidSize {
            declared: size,
            available: bytes.len(),
        });
    }
    let kind = MessageKind::try_from(kind_raw)?;
    let (this, rest) = bytes.split_at(size);
    Ok((
        Message {
            kind,
            header: &this[..MESSAGE_HEADER_LEN],
            body: &this[MESSAGE_HEADER_LEN..],
        },
        rest,
    ))
}

/// Decoded SET_KEY message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetKey {
    /// Sender's self-declared handshake status code.
    pub sender_status: u32,
    pub creation: Timestamp,
    pub wrapped_key: [u8; WRAPPED_KEY_LEN],
    pub target: PeerId,
    pub signature: [u8; SIGNATURE_LEN],
}

impl SetKey {
    /// Bytes covered by the SET_KEY signature.
    pub fn signed_region(
        creation: Timestamp,
        wrapped_key: &[u8; WRAPPED_KEY_LEN],
        target: &PeerId,
    ) -> [u8; SET_KEY_SIGNED_LEN] {
        let mut out = [0u8; SET_KEY_SIGNED_LEN];
        out[0..4].copy_from_slice(&SET_KEY_PURPOSE.to_be_bytes());
        out[4..8].copy_from_slice(&(SET_KEY_SIGNED_LEN as u32).to_be_bytes());
        out[8..16].copy_from_slice(&creation.as_millis().to_be_bytes());
        out[16..16 + WRAPPED_KEY_LEN].copy_from_slice(wrapped_key);
        out[16 + WRAPPED_KEY_LEN..].copy_from_slice(target.as_bytes());
        out
    }

    pub fn signed_bytes(&self) -> [u8; SET_KEY_SIGNED_LEN] {
        Self::signed_region(self.creation, &self.wrapped_key, &self.target)
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(SET_KEY_LEN);
        out.put_u16(MessageKind::SetKey as u16);
        out.put_u16(SET_KEY_LEN as u16);
        out.put_u32(self.sender_status);
        out.put_slice(&self.signed_bytes());
        out.put_slice(&self.signature);
        out.freeze()
    }

    /// Parses a SET_KEY body (everything after the top-level header).
    pub fn parse(body: &[u8]) -> Result<Self, WireError> {
        let expected = SET_KEY_LEN - MESSAGE_HEADER_LEN;
        if body.len() != expected {
            return Err(WireError::LengthMismatch {
                kind: MessageKind::SetKey,
                expected: SET_KEY_LEN,
                actual: body.len() + MESSAGE_HEADER_LEN,
            });
        }
        let sender_status = read_u32(body, 0);
        let purpose = read_u32(body, 4);
        let size = read_u32(body, 8);
        if purpose != SET_KEY_PURPOSE || size as usize != SET_KEY_SIGNED_LEN {
            return Err(WireError::BadPurpose { purpose, size });
        }
        let creation = Timestamp::from_millis(read_u64(body, 12));
        let mut wrapped_key = [0u8; WRAPPED_KEY_LEN];
        wrapped_key.copy_from_slice(&body[20..20 + WRAPPED_KEY_LEN]);
        let target = read_peer_id(body, 20 + WRAPPED_KEY_LEN);
        let mut signature = [0u8; SIGNATURE_LEN];
        signature.copy_from_slice(&body[20 + WRAPPED_KEY_LEN + PEER_ID_LEN..]);
        Ok(Self {
            sender_status,
            creation,
            wrapped_key,
            target,
            signature,
        })
    }
}

/// Cleartext content of a PING.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPayload {
    pub challenge: u32,
    pub target: PeerId,
}

impl PingPayload {
    pub fn encode(&self) -> [u8; PING_PLAIN_LEN] {
        let mut out = [0u8; PING_PLAIN_LEN];
        out[..4].copy_from_slice(&self.challenge.to_be_bytes());
        out[4..].copy_from_slice(self.target.as_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != PING_PLAIN_LEN {
            return Err(WireError::LengthMismatch {
                kind: MessageKind::Ping,
                expected: PING_PLAIN_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            challenge: read_u32(bytes, 0),
            target: read_peer_id(bytes, 4),
        })
    }
}

/// Cleartext content of a PONG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PongPayload {
    pub challenge: u32,
    pub inbound_bpm: u32,
    pub target: PeerId,
}

impl PongPayload {
    pub fn encode(&self) -> [u8; PONG_PLAIN_LEN] {
        let mut out = [0u8; PONG_PLAIN_LEN];
        out[..4].copy_from_slice(&self.challenge.to_be_bytes());
        out[4..8].copy_from_slice(&self.inbound_bpm.to_be_bytes());
        out[8..].copy_from_slice(self.target.as_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() != PONG_PLAIN_LEN {
            return Err(WireError::LengthMismatch {
                kind: MessageKind::Pong,
                expected: PONG_PLAIN_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            challenge: read_u32(bytes, 0),
            inbound_bpm: read_u32(bytes, 4),
            target: read_peer_id(bytes, 8),
        })
    }
}

/// Header for a PING or PONG message.
pub fn control_header(kind: MessageKind) -> Result<[u8; MESSAGE_HEADER_LEN], WireError> {
    match kind {
        MessageKind::Ping => message_header(kind, PING_LEN),
        MessageKind::Pong => message_header(kind, PONG_LEN),
        other => Err(WireError::UnknownKind(other as u16)),
    }
}

/// Assembles a sealed PING/PONG from its header, nonce and ciphertext.
pub fn encode_control(header: &[u8; MESSAGE_HEADER_LEN], nonce: &Nonce, ciphertext: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(MESSAGE_HEADER_LEN + XCHACHA20_NONCE_LEN + ciphertext.len());
    out.put_slice(header);
    out.put_slice(nonce.as_bytes());
    out.put_slice(ciphertext);
    out.freeze()
}

/// Splits a PING/PONG body into nonce and ciphertext after checking its length.
pub fn split_control<'a>(message: &Message<'a>) -> Result<(Nonce, &'a [u8]), WireError> {
    let expected = match message.kind {
        MessageKind::Ping => PING_LEN,
        MessageKind::Pong => PONG_LEN,
        other => return Err(WireError::UnknownKind(other as u16)),
    };
    if message.size() != expected {
        return Err(WireError::LengthMismatch {
            kind: message.kind,
            expected,
            actual: message.size(),
        });
    }
    let nonce = Nonce::from_prefix(message.body).ok_or(WireError::BufferTooShort {
        expected: XCHACHA20_NONCE_LEN,
        actual: message.body.len(),
    })?;
    Ok((nonce, &message.body[XCHACHA20_NONCE_LEN..]))
}

/// Decrypted body prefix of an encrypted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BodyHeader {
    pub seq: u32,
    pub inbound_bpm: u32,
    pub timestamp: Timestamp,
}

impl BodyHeader {
    pub fn write(&self, out: &mut BytesMut) {
        out.put_u32(self.seq);
        out.put_u32(self.inbound_bpm);
        out.put_u64(self.timestamp.as_millis());
    }

    /// Parses the body header and returns the trailing sub-message bytes.
    pub fn parse(body: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if body.len() < BODY_HEADER_LEN {
            return Err(WireError::BufferTooShort {
                expected: BODY_HEADER_LEN,
                actual: body.len(),
            });
        }
        let header = Self {
            seq: read_u32(body, 0),
            inbound_bpm: read_u32(body, 4),
            timestamp: Timestamp::from_millis(read_u64(body, 8)),
        };
        Ok((header, &body[BODY_HEADER_LEN..]))
    }
}

/// Header for an encrypted frame whose plaintext body is `body_len` bytes.
pub fn encrypted_header(body_len: usize) -> Result<[u8; MESSAGE_HEADER_LEN], WireError> {
    message_header(
        MessageKind::Encrypted,
        MESSAGE_HEADER_LEN + INTEGRITY_HASH_LEN + body_len + TAG_LEN,
    )
}

/// Assembles an encrypted frame.
pub fn encode_encrypted(
    header: &[u8; MESSAGE_HEADER_LEN],
    hash: &[u8; INTEGRITY_HASH_LEN],
    ciphertext: &[u8],
) -> Bytes {
    let mut out = BytesMut::with_capacity(MESSAGE_HEADER_LEN + INTEGRITY_HASH_LEN + ciphertext.len());
    out.put_slice(header);
    out.put_slice(hash);
    out.put_slice(ciphertext);
    out.freeze()
}

/// Splits an encrypted frame body into integrity hash and ciphertext.
pub fn split_encrypted<'a>(message: &Message<'a>) -> Result<(&'a [u8], &'a [u8]), WireError> {
    let min = INTEGRITY_HASH_LEN + BODY_HEADER_LEN + TAG_LEN;
    if message.body.len() < min {
        return Err(WireError::BufferTooShort {
            expected: min + MESSAGE_HEADER_LEN,
            actual: message.size(),
        });
    }
    Ok(message.body.split_at(INTEGRITY_HASH_LEN))
}

/// Encodes one sub-message (`size | type | payload`).
pub fn encode_sub_message(msg_type: u16, payload: &[u8]) -> Result<Bytes, WireError> {
    let size = SUB_HEADER_LEN + payload.len();
    if size > MAX_MESSAGE_SIZE {
        return Err(WireError::Oversized(size));
    }
    let mut out = BytesMut::with_capacity(size);
    out.put_u16(size as u16);
    out.put_u16(msg_type);
    out.put_slice(payload);
    Ok(out.freeze())
}

/// One application sub-message inside a decrypted body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubMessage<'a> {
    pub msg_type: u16,
    /// Declared size including the sub-message header.
    pub size: u16,
    pub payload: &'a [u8],
}

/// Iterates concatenated sub-messages; stops after the first malformed one.
#[derive(Debug, Clone)]
pub struct SubMessages<'a> {
    rest: &'a [u8],
    failed: bool,
}

pub fn sub_messages(bytes: &[u8]) -> SubMessages<'_> {
    SubMessages {
        rest: bytes,
        failed: false,
    }
}

impl<'a> Iterator for SubMessages<'a> {
    type Item = Result<SubMessage<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < SUB_HEADER_LEN {
            self.failed = true;
            return Some(Err(WireError::BufferTooShort {
                expected: SUB_HEADER_LEN,
                actual: self.rest.len(),
            }));
        }
        let size = read_u16(self.rest, 0);
        let msg_type = read_u16(self.rest, 2);
        let len = size as usize;
        if len < SUB_HEADER_LEN || len > self.rest.len() {
            self.failed = true;
            return Some(Err(WireError::InvalidSize {
                declared: len,
                available: self.rest.len(),
            }));
        }
        let (this, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(Ok(SubMessage {
            msg_type,
            size,
            payload: &this[SUB_HEADER_LEN..],
        }))
    }
}
