//! Tunnel layer - multiplexed stream management
//!
//! Provides:
//! - Frame encoding/decoding (resumable across partial reads)
//! - Per-stream state machine with credit-based flow control
//! - The per-connection session actor owning the stream table

mod frame;
mod session;
mod stream;

pub use frame::{ConnectPayload, Frame, FrameCodec, FRAME_HEADER_SIZE};
pub use session::{SessionConfig, TunnelSession};
pub use stream::{StreamState, TunnelStream};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Payload too large: {0} > {1}")]
    PayloadTooLarge(usize, usize),

    #[error("Duplicate stream id: {0}")]
    DuplicateStream(u32),

    #[error("Stream id 0 is reserved")]
    ReservedStreamId,

    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Flow control violation on stream {0}")]
    FlowControl(u32),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// Protocol violations are fatal to the whole connection; everything
    /// else is scoped to a single stream or the transport itself.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TunnelError::MalformedFrame(_)
                | TunnelError::PayloadTooLarge(..)
                | TunnelError::DuplicateStream(_)
                | TunnelError::ReservedStreamId
                | TunnelError::Protocol(_)
        )
    }
}

/// Maximum number of concurrent streams per connection (default)
pub const DEFAULT_MAX_STREAMS: usize = 256;

/// Default initial per-stream window for flow control (256 KB)
pub const DEFAULT_STREAM_WINDOW: u32 = 262144;

/// Default cap on buffered-but-unsent outbound bytes per stream (128 KB)
pub const DEFAULT_MAX_BUFFERED: usize = 131072;
