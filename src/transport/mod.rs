//! Transport layer
//!
//! The session consumes an upgraded connection as a raw bidirectional
//! byte transport. Two implementations are provided:
//! - `WsTransport`: WebSocket (the gateway's production path); binary
//!   messages carry the frame byte stream
//! - `StreamTransport`: any `AsyncRead + AsyncWrite` byte stream (raw
//!   TCP tunnels, in-memory duplex pipes in tests)

mod stream;
mod ws;

pub use stream::{StreamReader, StreamTransport, StreamWriter};
pub use ws::{WsReader, WsTransport, WsWriter};

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            WsError::Io(e) => TransportError::Io(e),
            other => TransportError::WebSocket(other.to_string()),
        }
    }
}

/// Read half of a tunnel transport
#[async_trait]
pub trait TransportReader: Send {
    /// Receive the next chunk of bytes; `None` means clean EOF.
    ///
    /// Chunk boundaries carry no meaning; frames may span chunks.
    async fn recv(&mut self) -> Result<Option<Bytes>, TransportError>;
}

/// Write half of a tunnel transport
#[async_trait]
pub trait TransportWriter: Send {
    /// Send a chunk of bytes
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the transport; idempotent
    async fn close(&mut self) -> Result<(), TransportError>;
}
