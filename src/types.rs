//! Core protocol types shared across the frame codec, handshake and
//! connection layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

/// Unique identifier for WebSocket connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte stream a connection runs over. Plain TCP sockets, TLS-wrapped
/// streams and in-memory duplex pipes (tests) all satisfy this.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Owned transport handle as handed to the registry.
pub type Transport = Box<dyn AsyncStream>;

/// Frame opcode (RFC 6455 §5.2, 4-bit field)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl OpCode {
    /// Maps the low nibble of the first frame byte. Unknown nibbles
    /// (reserved opcodes) yield `None`.
    pub fn from_u4(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_u4(self) -> u8 {
        self as u8
    }
}

/// Close status code carried in the first two bytes of a Close payload.
///
/// 1004-1006 and 1015 are reserved: recognized on receipt, never sent by
/// this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    GoingAway = 1001,
    ProtocolError = 1002,
    DataTypeNotSupported = 1003,
    Reserved = 1004,
    NoStatus = 1005,
    AbnormalClose = 1006,
    DataTypeMismatch = 1007,
    PolicyViolation = 1008,
    MessageTooLarge = 1009,
    EndpointExpectsExtension = 1010,
    ServerInternalError = 1011,
    TlsHandshakeFailed = 1015,
}

impl CloseCode {
    /// Strict mapping; `None` for values outside the recognized set.
    pub fn try_from_u16(value: u16) -> Option<Self> {
        match value {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::ProtocolError),
            1003 => Some(Self::DataTypeNotSupported),
            1004 => Some(Self::Reserved),
            1005 => Some(Self::NoStatus),
            1006 => Some(Self::AbnormalClose),
            1007 => Some(Self::DataTypeMismatch),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::MessageTooLarge),
            1010 => Some(Self::EndpointExpectsExtension),
            1011 => Some(Self::ServerInternalError),
            1015 => Some(Self::TlsHandshakeFailed),
            _ => None,
        }
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Parsed Close frame payload delivered to the close callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    pub code: CloseCode,
    pub reason: Option<String>,
}

impl CloseEvent {
    /// Parses a Close payload: big-endian code in the first two bytes,
    /// UTF-8 reason in the remainder. Fewer than two bytes, or a code
    /// outside the recognized set, falls back to `Normal` with no reason.
    pub fn from_payload(payload: &[u8]) -> Self {
        if payload.len() < 2 {
            return Self {
                code: CloseCode::Normal,
                reason: None,
            };
        }

        let raw = u16::from_be_bytes([payload[0], payload[1]]);
        match CloseCode::try_from_u16(raw) {
            Some(code) => {
                let reason = if payload.len() > 2 {
                    Some(String::from_utf8_lossy(&payload[2..]).into_owned())
                } else {
                    None
                };
                Self { code, reason }
            }
            None => Self {
                code: CloseCode::Normal,
                reason: None,
            },
        }
    }
}

/// One decoded WebSocket frame. Immutable once constructed; produced only
/// by the frame codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final-fragment flag (FIN bit)
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Vec<u8>,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Transport accepted, nothing negotiated yet
    Connecting,
    /// Reading and validating the HTTP upgrade request
    Handshaking,
    /// Upgrade complete, receive loop running
    Open,
    /// Close initiated, teardown in progress
    Closing,
    /// Terminal; re-entering is a no-op
    Closed,
}
