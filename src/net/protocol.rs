//! Wire protocol: packet header, service/method identifiers and body codecs.
//!
//! Every packet is a fixed 12-byte header followed by `body_length` bytes:
//!
//! ```text
//! +------------+-----------+----------------+-------------+------------------+
//! | service_id | method_id | correlation_id | body_length | body             |
//! | u16 BE     | u16 BE    | u32 BE         | u32 BE      | body_length bytes|
//! +------------+-----------+----------------+-------------+------------------+
//! ```
//!
//! All integers, in headers and bodies, are big-endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::net::framing::{FrameBuilder, FrameReader};

/// Size of the encoded header in bytes
pub const HEADER_SIZE: usize = 12;

/// Largest body a peer may declare (64 KiB)
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Service identifiers
pub mod service {
    /// Login handshake (challenge + credential check)
    pub const AUTHENTICATION: u16 = 0x0001;
    /// Connection housekeeping (keepalive)
    pub const CONNECTION: u16 = 0x0002;
    /// Friends list (not served, but routed as authenticated-only)
    pub const FRIENDS: u16 = 0x0003;
    /// Characters and play sessions
    pub const GAME_UTILITIES: u16 = 0x0004;

    /// Whether packets on this service may only be sent after authentication
    pub fn requires_auth(service_id: u16) -> bool {
        !matches!(service_id, AUTHENTICATION | CONNECTION)
    }
}

/// Method identifiers for [`service::AUTHENTICATION`]
pub mod auth_method {
    pub const CHALLENGE_REQUEST: u16 = 0x0001;
    pub const CHALLENGE_RESPONSE: u16 = 0x0002;
    pub const SESSION_REQUEST: u16 = 0x0003;
    pub const SESSION_RESPONSE: u16 = 0x0004;
}

/// Method identifiers for [`service::CONNECTION`]
pub mod connection_method {
    pub const PING: u16 = 0x0001;
    pub const PONG: u16 = 0x0002;
}

/// Method identifiers for [`service::GAME_UTILITIES`]
pub mod game_method {
    pub const CHARACTER_LIST_REQUEST: u16 = 0x0001;
    pub const CHARACTER_LIST_RESPONSE: u16 = 0x0002;
    pub const CREATE_SESSION: u16 = 0x0003;
    pub const JOIN_SESSION: u16 = 0x0004;
    pub const LEAVE_SESSION: u16 = 0x0005;
    pub const SESSION_CHAT: u16 = 0x0006;
    pub const SET_SESSION_OPTIONS: u16 = 0x0007;
    pub const SESSION_RESPONSE: u16 = 0x0010;
    pub const PLAYER_JOINED: u16 = 0x0011;
    pub const PLAYER_LEFT: u16 = 0x0012;
    pub const CHAT_MESSAGE: u16 = 0x0013;
}

/// First byte of message bodies that carry a message type
pub mod message_type {
    pub const AUTH_REQUEST: u8 = 0x01;
    pub const AUTH_RESPONSE: u8 = 0x02;
    pub const PING: u8 = 0x03;
    pub const PONG: u8 = 0x04;
}

/// Fixed-size packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub service_id: u16,
    pub method_id: u16,
    pub correlation_id: u32,
    pub body_length: u32,
}

impl PacketHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..2].copy_from_slice(&self.service_id.to_be_bytes());
        buf[2..4].copy_from_slice(&self.method_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.correlation_id.to_be_bytes());
        buf[8..12].copy_from_slice(&self.body_length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            service_id: u16::from_be_bytes([buf[0], buf[1]]),
            method_id: u16::from_be_bytes([buf[2], buf[3]]),
            correlation_id: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            body_length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }
    }

    /// Whether the declared body length is within protocol limits
    pub fn body_within_limit(&self) -> bool {
        self.body_length as usize <= MAX_BODY_SIZE
    }
}

/// A decoded packet: routing identifiers plus body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub service_id: u16,
    pub method_id: u16,
    pub correlation_id: u32,
    pub body: Bytes,
}

impl Packet {
    pub fn new(service_id: u16, method_id: u16, correlation_id: u32, body: impl Into<Bytes>) -> Self {
        Self {
            service_id,
            method_id,
            correlation_id,
            body: body.into(),
        }
    }

    /// Build a reply on the same service and correlation id
    pub fn reply(&self, method_id: u16, body: impl Into<Bytes>) -> Self {
        Self::new(self.service_id, method_id, self.correlation_id, body)
    }

    pub fn header(&self) -> PacketHeader {
        PacketHeader {
            service_id: self.service_id,
            method_id: self.method_id,
            correlation_id: self.correlation_id,
            body_length: self.body.len() as u32,
        }
    }

    /// Encode header and body into one contiguous buffer
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.body.len());
        buf.put_slice(&self.header().encode());
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// Errors decoding a packet body
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BodyError {
    #[error("body truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unexpected message type 0x{0:02x}")]
    UnexpectedType(u8),
    #[error("invalid utf-8 in {0}")]
    InvalidText(&'static str),
}

/// Credentials carried by an auth request body:
/// `[type:u8][loginLen:u8][login][passwordLen:u8][password]`
#[derive(Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub login: String,
    pub password: String,
}

impl std::fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRequest")
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl AuthRequest {
    pub fn parse(body: &[u8]) -> Result<Self, BodyError> {
        let mut reader = FrameReader::new(body);
        let kind = reader.read_u8().ok_or(BodyError::Truncated {
            needed: 1,
            available: 0,
        })?;
        if kind != message_type::AUTH_REQUEST {
            return Err(BodyError::UnexpectedType(kind));
        }
        let login = read_short_string(&mut reader, "login")?;
        let password = read_short_string(&mut reader, "password")?;
        Ok(Self { login, password })
    }

    pub fn encode(&self) -> Vec<u8> {
        FrameBuilder::with_capacity(3 + self.login.len() + self.password.len())
            .write_u8(message_type::AUTH_REQUEST)
            .write_str8(&self.login)
            .write_str8(&self.password)
            .build()
    }
}

/// Auth reply body: `[0x02][0x01 = success | 0x00 = failure]`
pub fn auth_response_body(success: bool) -> Vec<u8> {
    vec![message_type::AUTH_RESPONSE, u8::from(success)]
}

pub fn pong_body() -> Vec<u8> {
    vec![message_type::PONG]
}

/// Read a `[len:u8][bytes]` string
pub fn read_short_string(reader: &mut FrameReader<'_>, field: &'static str) -> Result<String, BodyError> {
    let len = reader.read_u8().ok_or(BodyError::Truncated {
        needed: 1,
        available: reader.remaining().len(),
    })? as usize;
    let available = reader.remaining().len();
    let bytes = reader.read(len).ok_or(BodyError::Truncated {
        needed: len,
        available,
    })?;
    String::from_utf8(bytes.to_vec()).map_err(|_| BodyError::InvalidText(field))
}
