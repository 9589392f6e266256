//! Auth-worker wire protocol
//!
//! Fixed-layout little-endian frames over a local stream socket. The
//! client sends a 4-byte handshake carrying its pid; the worker answers
//! with an 8-byte handshake carrying its pid and advertised mechanism
//! bitset. After that the client sends `NEW`/`CONTINUE` request frames and
//! the worker answers with reply frames, each correlated by a 32-bit
//! request id.

use bitflags::bitflags;

/// Client handshake frame size (`pid`)
pub const HANDSHAKE_INPUT_SIZE: usize = 4;
/// Worker handshake frame size (`pid`, `auth_mechanisms`)
pub const HANDSHAKE_OUTPUT_SIZE: usize = 8;
/// Reply frame header size (`id`, `result`, `data_size`)
pub const REPLY_HEADER_SIZE: usize = 9;
/// Hard cap on a reply payload; anything larger is a worker bug
pub const MAX_REPLY_DATA_SIZE: usize = 50 * 1024;

/// `type` discriminant of a `NEW` request frame
pub const REQUEST_TYPE_NEW: u8 = 1;
/// `type` discriminant of a `CONTINUE` request frame
pub const REQUEST_TYPE_CONTINUE: u8 = 2;

/// Client protocol identifier carried in a `NEW` frame
pub const PROTOCOL_IMAP: u8 = 1;
pub const PROTOCOL_POP3: u8 = 2;

bitflags! {
    /// Mechanism bitset as advertised in a worker handshake
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MechSet: u32 {
        const PLAIN = 1 << 0;
        const LOGIN = 1 << 1;
        const CRAM_MD5 = 1 << 2;
        const DIGEST_MD5 = 1 << 3;
        const ANONYMOUS = 1 << 4;
        const EXTERNAL = 1 << 5;
    }
}

/// A single SASL mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    Plain,
    Login,
    CramMd5,
    DigestMd5,
    Anonymous,
    External,
}

impl Mechanism {
    /// Bitset representation used on the wire and in routing
    pub fn bit(self) -> MechSet {
        match self {
            Self::Plain => MechSet::PLAIN,
            Self::Login => MechSet::LOGIN,
            Self::CramMd5 => MechSet::CRAM_MD5,
            Self::DigestMd5 => MechSet::DIGEST_MD5,
            Self::Anonymous => MechSet::ANONYMOUS,
            Self::External => MechSet::EXTERNAL,
        }
    }

    /// Canonical SASL name
    pub fn name(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
            Self::CramMd5 => "CRAM-MD5",
            Self::DigestMd5 => "DIGEST-MD5",
            Self::Anonymous => "ANONYMOUS",
            Self::External => "EXTERNAL",
        }
    }
}

/// Reply result code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// More client input required
    Continue = 0,
    Ok = 1,
    Fail = 2,
}

impl TryFrom<u8> for AuthStatus {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(Self::Continue),
            1 => Ok(Self::Ok),
            2 => Ok(Self::Fail),
            other => Err(other),
        }
    }
}

/// Decoded worker handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeOutput {
    pub pid: u32,
    pub mechanisms: MechSet,
}

/// Decoded reply frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyHeader {
    pub id: u32,
    pub status: AuthStatus,
    pub data_size: u32,
}

pub fn encode_handshake_input(pid: u32) -> [u8; HANDSHAKE_INPUT_SIZE] {
    pid.to_le_bytes()
}

pub fn decode_handshake_output(buf: &[u8; HANDSHAKE_OUTPUT_SIZE]) -> HandshakeOutput {
    HandshakeOutput {
        pid: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        mechanisms: MechSet::from_bits_truncate(u32::from_le_bytes([
            buf[4], buf[5], buf[6], buf[7],
        ])),
    }
}

pub fn encode_handshake_output(pid: u32, mechanisms: MechSet) -> [u8; HANDSHAKE_OUTPUT_SIZE] {
    let mut buf = [0u8; HANDSHAKE_OUTPUT_SIZE];
    buf[..4].copy_from_slice(&pid.to_le_bytes());
    buf[4..].copy_from_slice(&mechanisms.bits().to_le_bytes());
    buf
}

/// Encode a `NEW` request frame
pub fn encode_request_new(id: u32, protocol: u8, mech: Mechanism) -> [u8; 10] {
    let mut buf = [0u8; 10];
    buf[0] = REQUEST_TYPE_NEW;
    buf[1..5].copy_from_slice(&id.to_le_bytes());
    buf[5] = protocol;
    buf[6..10].copy_from_slice(&mech.bit().bits().to_le_bytes());
    buf
}

/// Encode a `CONTINUE` request frame with its length-prefixed payload
pub fn encode_request_continue(id: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9 + data.len());
    buf.push(REQUEST_TYPE_CONTINUE);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}

/// Decode a reply header; `Err` carries the unknown result byte
pub fn decode_reply_header(buf: &[u8; REPLY_HEADER_SIZE]) -> Result<ReplyHeader, u8> {
    let status = AuthStatus::try_from(buf[4])?;
    Ok(ReplyHeader {
        id: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
        status,
        data_size: u32::from_le_bytes([buf[5], buf[6], buf[7], buf[8]]),
    })
}

/// Encode a reply frame (worker side; used by tests standing in for one)
pub fn encode_reply(id: u32, status: AuthStatus, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(REPLY_HEADER_SIZE + data.len());
    buf.extend_from_slice(&id.to_le_bytes());
    buf.push(status as u8);
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    buf
}
