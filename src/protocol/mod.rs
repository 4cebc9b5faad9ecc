//! Protocol definitions and constants
//!
//! Wire-level values shared between the frame codec and the session layer.
//! Integer fields are little-endian on the wire, matching the Wisp protocol
//! spoken by browser proxy clients.

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid stream kind: {0}")]
    InvalidStreamKind(u8),

    #[error("Invalid connect payload: {0}")]
    InvalidConnect(String),
}

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Stream id 0 is reserved for connection-level frames (the initial
/// window advertisement); CONNECT may never use it.
pub const CONTROL_STREAM_ID: u32 = 0;

/// Packet types carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// Open a new logical stream to a target
    Connect = 0x01,
    /// Payload bytes for an open stream
    Data = 0x02,
    /// Flow-control credit grant
    Continue = 0x03,
    /// Close a stream, with an optional reason code
    Close = 0x04,
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Connect),
            0x02 => Ok(PacketType::Data),
            0x03 => Ok(PacketType::Continue),
            0x04 => Ok(PacketType::Close),
            _ => Err(ProtocolError::InvalidPacketType(value)),
        }
    }
}

/// Protocol kind of a logical stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamKind {
    Tcp = 0x01,
    Udp = 0x02,
}

impl TryFrom<u8> for StreamKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(StreamKind::Tcp),
            0x02 => Ok(StreamKind::Udp),
            _ => Err(ProtocolError::InvalidStreamKind(value)),
        }
    }
}

/// Reason codes carried in CLOSE frames.
///
/// A small closed enumeration; values are Wisp-compatible so existing
/// browser clients interpret them correctly. Unknown incoming values
/// decode to `Unspecified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CloseReason {
    /// No reason given
    Unspecified = 0x01,
    /// Clean close (voluntary, or remote EOF)
    Voluntary = 0x02,
    /// Unexpected network error mid-stream
    NetworkError = 0x03,
    /// Target refused the connection
    ConnectionRefused = 0x41,
    /// Dial did not complete within the timeout
    DialTimeout = 0x42,
    /// Target host unreachable
    HostUnreachable = 0x43,
    /// Refused by gateway policy (e.g. UDP disabled)
    Blocked = 0x47,
    /// Stream or buffer limit exceeded
    Throttled = 0x48,
}

impl From<u8> for CloseReason {
    fn from(value: u8) -> Self {
        match value {
            0x02 => CloseReason::Voluntary,
            0x03 => CloseReason::NetworkError,
            0x41 => CloseReason::ConnectionRefused,
            0x42 => CloseReason::DialTimeout,
            0x43 => CloseReason::HostUnreachable,
            0x47 => CloseReason::Blocked,
            0x48 => CloseReason::Throttled,
            _ => CloseReason::Unspecified,
        }
    }
}

impl CloseReason {
    /// Map a dial error to the reason reported to the client
    pub fn from_dial_error(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => CloseReason::ConnectionRefused,
            ErrorKind::TimedOut => CloseReason::DialTimeout,
            ErrorKind::HostUnreachable | ErrorKind::NetworkUnreachable => {
                CloseReason::HostUnreachable
            }
            _ => CloseReason::NetworkError,
        }
    }
}
