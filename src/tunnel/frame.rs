//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format (integers little-endian, per the Wisp wire contract):
//! ```text
//! +--------+--------+--------+--------+
//! |        Length (4B LE)             |  = 5 + payload length
//! +--------+--------+--------+--------+
//! |  Type  |     Stream ID (4B LE)    |
//! +--------+--------+--------+--------+
//! |  ...ID |          Payload         |
//! +--------+--------+--------+--------+
//! ```
//!
//! Payloads by type:
//! - CONNECT: `kind u8` (0x01 tcp, 0x02 udp), `port u16 LE`, host (UTF-8)
//! - DATA: raw bytes
//! - CONTINUE: `credit u32 LE` (additional send-window)
//! - CLOSE: `reason u8` (optional; empty means unspecified)

use super::TunnelError;
use crate::protocol::{CloseReason, PacketType, ProtocolError, StreamKind};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Fixed header size after the length prefix: type (1) + stream id (4)
pub const FRAME_HEADER_SIZE: usize = 5;

/// Size of the length prefix
const LENGTH_PREFIX_SIZE: usize = 4;

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Packet type
    pub packet_type: PacketType,
    /// Stream ID (0 for connection-level frames)
    pub stream_id: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Create a CONNECT frame for a new stream
    pub fn connect(stream_id: u32, target: &ConnectPayload) -> Self {
        Self {
            packet_type: PacketType::Connect,
            stream_id,
            payload: target.encode(),
        }
    }

    /// Create a DATA frame
    pub fn data(stream_id: u32, payload: Bytes) -> Self {
        Self {
            packet_type: PacketType::Data,
            stream_id,
            payload,
        }
    }

    /// Create a CONTINUE frame granting additional send-window
    pub fn continue_grant(stream_id: u32, credit: u32) -> Self {
        let mut payload = BytesMut::with_capacity(4);
        payload.put_u32_le(credit);
        Self {
            packet_type: PacketType::Continue,
            stream_id,
            payload: payload.freeze(),
        }
    }

    /// Create a CLOSE frame carrying a reason code
    pub fn close(stream_id: u32, reason: CloseReason) -> Self {
        Self {
            packet_type: PacketType::Close,
            stream_id,
            payload: Bytes::copy_from_slice(&[reason as u8]),
        }
    }

    /// Credit carried by a CONTINUE frame
    pub fn continue_credit(&self) -> Result<u32, TunnelError> {
        if self.payload.len() < 4 {
            return Err(TunnelError::MalformedFrame(
                "CONTINUE payload shorter than 4 bytes".to_string(),
            ));
        }
        Ok(u32::from_le_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]))
    }

    /// Reason carried by a CLOSE frame; empty payload means unspecified
    pub fn close_reason(&self) -> CloseReason {
        self.payload
            .first()
            .map(|b| CloseReason::from(*b))
            .unwrap_or(CloseReason::Unspecified)
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let body_len = FRAME_HEADER_SIZE + self.payload.len();
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + body_len);

        buf.put_u32_le(body_len as u32);
        buf.put_u8(self.packet_type as u8);
        buf.put_u32_le(self.stream_id);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        LENGTH_PREFIX_SIZE + FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Target description carried in a CONNECT payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPayload {
    /// Protocol kind (TCP or UDP)
    pub kind: StreamKind,
    /// Target hostname or IP literal
    pub host: String,
    /// Target port
    pub port: u16,
}

impl ConnectPayload {
    /// Parse a CONNECT payload
    pub fn parse(payload: &[u8]) -> Result<Self, TunnelError> {
        if payload.len() < 4 {
            return Err(ProtocolError::InvalidConnect(
                "payload shorter than 4 bytes".to_string(),
            )
            .into());
        }

        let kind = StreamKind::try_from(payload[0])?;
        let port = u16::from_le_bytes([payload[1], payload[2]]);
        let host = std::str::from_utf8(&payload[3..])
            .map_err(|_| ProtocolError::InvalidConnect("host is not UTF-8".to_string()))?
            .to_string();

        if host.is_empty() {
            return Err(ProtocolError::InvalidConnect("empty host".to_string()).into());
        }
        if port == 0 {
            return Err(ProtocolError::InvalidConnect("port 0".to_string()).into());
        }

        Ok(Self { kind, host, port })
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(3 + self.host.len());
        buf.put_u8(self.kind as u8);
        buf.put_u16_le(self.port);
        buf.extend_from_slice(self.host.as_bytes());
        buf.freeze()
    }

    /// Target as a dialable "host:port" string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Resumable frame decoder.
///
/// The transport delivers arbitrary chunk boundaries; the codec keeps an
/// internal buffer and yields one frame per call once a full frame is
/// available, consuming nothing otherwise. A declared payload beyond
/// `max_payload` is fatal for the whole connection.
pub struct FrameCodec {
    buf: BytesMut,
    max_payload: usize,
}

impl FrameCodec {
    /// Create a codec enforcing the given payload ceiling
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            max_payload,
        }
    }

    /// Append raw transport bytes to the decode buffer
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Decode the next complete frame, if any.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Errors are fatal:
    /// the buffer contents are unspecified afterwards and the connection
    /// must be torn down.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, TunnelError> {
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        // Peek at the length prefix without consuming
        let body_len =
            u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;

        if body_len < FRAME_HEADER_SIZE {
            return Err(TunnelError::MalformedFrame(format!(
                "declared length {} below header size",
                body_len
            )));
        }

        let payload_len = body_len - FRAME_HEADER_SIZE;
        if payload_len > self.max_payload {
            return Err(TunnelError::PayloadTooLarge(payload_len, self.max_payload));
        }

        if self.buf.len() < LENGTH_PREFIX_SIZE + body_len {
            return Ok(None);
        }

        self.buf.advance(LENGTH_PREFIX_SIZE);
        let packet_type = PacketType::try_from(self.buf.get_u8())?;
        let stream_id = self.buf.get_u32_le();
        let payload = self.buf.split_to(payload_len).freeze();

        Ok(Some(Frame {
            packet_type,
            stream_id,
            payload,
        }))
    }

    /// Bytes currently buffered awaiting a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
